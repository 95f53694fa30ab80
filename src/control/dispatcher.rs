//! Control request dispatcher
//!
//! One request moves through `Idle -> Decoding -> Executing -> Replying`
//! and back to `Idle`. A request that fails to decode skips `Executing`
//! entirely, so a malformed request never changes any state.

use super::protocol::{Command, ControlReply, ControlRequest};
use super::Status;
use crate::error::Result;
use crate::module::ModuleRegistry;
use crate::table::MappingTable;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Decoding,
    Executing,
    Replying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Decoding => "decoding",
            Phase::Executing => "executing",
            Phase::Replying => "replying",
        };
        f.write_str(s)
    }
}

/// Tracks one request through its phases
struct Transaction {
    code: u32,
    phase: Phase,
}

impl Transaction {
    fn begin(code: u32) -> Self {
        Self {
            code,
            phase: Phase::Idle,
        }
    }

    fn enter(&mut self, next: Phase) {
        let allowed = matches!(
            (self.phase, next),
            (Phase::Idle, Phase::Decoding)
                | (Phase::Decoding, Phase::Executing)
                | (Phase::Decoding, Phase::Replying)
                | (Phase::Executing, Phase::Replying)
                | (Phase::Replying, Phase::Idle)
        );
        assert!(allowed, "control request moved from {} to {}", self.phase, next);
        trace!(cmd = self.code, from = %self.phase, to = %next, "Control phase");
        self.phase = next;
    }
}

/// Executes control requests against the table and the module registry
pub struct Dispatcher {
    table: Arc<MappingTable>,
    modules: Arc<ModuleRegistry>,
}

impl Dispatcher {
    pub fn new(table: Arc<MappingTable>, modules: Arc<ModuleRegistry>) -> Self {
        Self { table, modules }
    }

    pub fn table(&self) -> &Arc<MappingTable> {
        &self.table
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Handle one request frame and produce its reply
    pub fn dispatch(&self, code: u32, payload: &[u8]) -> ControlReply {
        let mut tx = Transaction::begin(code);

        tx.enter(Phase::Decoding);
        let request = match ControlRequest::decode(code, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(cmd = code, error = %e, "Rejected control request");
                metrics::counter!("dm_control_rejected_total", "reason" => e.kind()).increment(1);
                tx.enter(Phase::Replying);
                let reply = ControlReply::error(&e);
                tx.enter(Phase::Idle);
                return reply;
            }
        };

        let command = request.command();
        debug!(cmd = command.as_str(), "Control request");

        tx.enter(Phase::Executing);
        let result = self.execute(request);

        tx.enter(Phase::Replying);
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(cmd = command.as_str(), error = %e, "Control request failed");
                ControlReply::error(&e)
            }
        };
        metrics::counter!(
            "dm_control_requests_total",
            "command" => command.as_str(),
            "status" => status_label(reply.status)
        )
        .increment(1);

        tx.enter(Phase::Idle);
        reply
    }

    /// Run an already decoded request
    pub fn execute(&self, request: ControlRequest) -> Result<ControlReply> {
        match request {
            ControlRequest::ListMappings => ControlReply::mappings(&self.table.list()),
            ControlRequest::Attach { name, backing_path } => {
                self.table.attach(&name, &backing_path)?;
                Ok(ControlReply::ok())
            }
            ControlRequest::Detach { name } => {
                self.table.detach(&name)?;
                Ok(ControlReply::ok())
            }
            ControlRequest::ListPlugins => ControlReply::plugins(&self.modules.list()),
            ControlRequest::LoadPlugin { name } => {
                self.modules.load(&name)?;
                Ok(ControlReply::ok())
            }
            ControlRequest::UnloadPlugin { name } => {
                self.modules.unload(&name)?;
                Ok(ControlReply::ok())
            }
        }
    }

    /// Whether `code` names a known command
    pub fn supports(code: u32) -> bool {
        Command::from_code(code).is_some()
    }
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Ok => "ok",
        Status::NotFound => "not_found",
        Status::Io => "io",
        Status::NoDevice => "no_device",
        Status::BadModule => "bad_module",
        Status::Fault => "fault",
        Status::Busy => "busy",
        Status::Exists => "exists",
        Status::Invalid => "invalid",
        Status::NoSpace => "no_space",
    }
}
