//! Control endpoint client used by the administration tool

use super::protocol::{read_reply, write_request, ControlReply, ControlRequest, ModuleRecord};
use crate::error::{Error, Result};
use crate::table::MappingEntry;
use std::path::Path;
use tokio::net::UnixStream;

/// Connection to a running mapper's control endpoint
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// Connect to the control socket at `path`
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        tracing::debug!(socket = %path.as_ref().display(), "Connected to control endpoint");
        Ok(Self { stream })
    }

    /// Send one request and wait for its reply. A non-OK status becomes
    /// [`Error::Remote`].
    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        write_request(&mut self.stream, request).await?;
        let reply = read_reply(&mut self.stream).await?;

        if !reply.status.is_ok() {
            tracing::debug!(
                cmd = request.command().as_str(),
                status = ?reply.status,
                "Control request refused"
            );
            return Err(Error::Remote(reply.status));
        }
        Ok(reply)
    }

    /// Every slot of the table; entry `i` describes slot `i`
    pub async fn list_mappings(&mut self) -> Result<Vec<MappingEntry>> {
        self.call(&ControlRequest::ListMappings).await?.decode_mappings()
    }

    pub async fn attach(&mut self, name: &str, backing_path: &str) -> Result<()> {
        self.call(&ControlRequest::Attach {
            name: name.to_string(),
            backing_path: backing_path.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn detach(&mut self, name: &str) -> Result<()> {
        self.call(&ControlRequest::Detach {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn list_plugins(&mut self) -> Result<Vec<ModuleRecord>> {
        self.call(&ControlRequest::ListPlugins).await?.decode_plugins()
    }

    pub async fn load_plugin(&mut self, name: &str) -> Result<()> {
        self.call(&ControlRequest::LoadPlugin {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn unload_plugin(&mut self, name: &str) -> Result<()> {
        self.call(&ControlRequest::UnloadPlugin {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }
}
