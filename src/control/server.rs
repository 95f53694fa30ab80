//! Unix-socket server for the control endpoint

use super::dispatcher::Dispatcher;
use super::protocol::{read_frame, write_reply, ControlReply};
use super::Status;
use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

/// Control endpoint server
///
/// Each connection may send any number of requests; they are answered in
/// order. Dispatch runs on the blocking pool since attach opens devices.
pub struct ControlServer {
    dispatcher: Arc<Dispatcher>,
    socket_path: PathBuf,
    max_connections: usize,
    connection_semaphore: Arc<Semaphore>,
    next_connection: AtomicU64,
}

impl ControlServer {
    /// Create a new control server
    pub fn new<P: AsRef<Path>>(dispatcher: Arc<Dispatcher>, socket_path: P, max_connections: usize) -> Self {
        Self {
            dispatcher,
            socket_path: socket_path.as_ref().to_path_buf(),
            max_connections,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Bind the control socket, replacing a stale one left by a previous run
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "Control server listening");
        Ok(listener)
    }

    /// Bind and serve until the process is stopped
    pub async fn serve(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve connections on `listener` until `shutdown` completes
    pub async fn serve_until<F>(&self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Acquire connection permit
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connection_semaphore).acquire_owned() => {
                    permit.map_err(|_| io::Error::other("connection semaphore closed"))?
                }
            };

            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept control connection");
                        continue;
                    }
                },
            };

            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let dispatcher = Arc::clone(&self.dispatcher);

            tokio::spawn(async move {
                tracing::debug!(connection = id, "Accepted control connection");

                if let Err(e) = handle_connection(dispatcher, stream).await {
                    tracing::warn!(connection = id, error = %e, "Control connection error");
                }

                tracing::debug!(connection = id, "Control connection closed");
                drop(permit);
            });
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(error = %e, "Control socket already gone");
        }
        tracing::info!("Control server stopped");
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Connection slots currently free
    pub fn available_connections(&self) -> usize {
        self.connection_semaphore.available_permits()
    }
}

/// Serve requests on one connection until the client hangs up
async fn handle_connection(dispatcher: Arc<Dispatcher>, mut stream: UnixStream) -> Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e @ Error::Decode(_)) => {
                // The stream cannot be resynchronized after a bad header
                write_reply(&mut stream, &ControlReply::status(Status::Fault)).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let dispatcher = Arc::clone(&dispatcher);
        let reply = tokio::task::spawn_blocking(move || dispatcher.dispatch(frame.header, &frame.payload))
            .await
            .map_err(io::Error::other)?;

        write_reply(&mut stream, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::client::ControlClient;
    use crate::device::MockDevices;
    use crate::endpoint::NullEndpoints;
    use crate::module::ModuleRegistry;
    use crate::table::MappingTable;

    fn test_dispatcher() -> Arc<Dispatcher> {
        let devices = MockDevices::new();
        devices.add_device("/dev/backing0", 512);
        let modules = Arc::new(ModuleRegistry::with_builtins());
        let table = MappingTable::new(16, Arc::new(devices), Arc::new(NullEndpoints), Arc::clone(&modules))
            .expect("Failed to create table");
        Arc::new(Dispatcher::new(Arc::new(table), modules))
    }

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("dm_server_{}_{}", tag, std::process::id()))
            .join("dm.sock")
    }

    #[tokio::test]
    async fn test_server_creation() {
        let path = socket_path("create");
        let server = ControlServer::new(test_dispatcher(), &path, 5);
        assert_eq!(server.socket_path(), path.as_path());
        assert_eq!(server.max_connections(), 5);
        assert_eq!(server.available_connections(), 5);
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() -> Result<()> {
        let path = socket_path("serve");
        let server = Arc::new(ControlServer::new(test_dispatcher(), &path, 4));
        let listener = server.bind()?;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve_until(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let mut client = ControlClient::connect(&path).await?;
        client.attach("data1", "/dev/backing0").await?;
        let entries = client.list_mappings().await?;
        assert_eq!(entries.len(), 16);
        assert_eq!(entries[1].name, "data1");

        assert!(matches!(
            client.attach("data1", "/dev/backing0").await,
            Err(Error::Remote(Status::Exists))
        ));
        client.detach("data1").await?;
        drop(client);

        let _ = stop_tx.send(());
        task.await.map_err(io::Error::other)??;
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_frame_gets_fault() -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let path = socket_path("fault");
        let server = Arc::new(ControlServer::new(test_dispatcher(), &path, 4));
        let listener = server.bind()?;
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve_until(listener, std::future::pending()).await })
        };

        let mut stream = UnixStream::connect(&path).await?;
        stream.write_u32_le(crate::control::protocol::LIST_MAPPINGS).await?;
        stream.write_u32_le(u32::MAX).await?;

        let reply = crate::control::protocol::read_reply(&mut stream).await?;
        assert_eq!(reply.status, Status::Fault);

        task.abort();
        Ok(())
    }
}
