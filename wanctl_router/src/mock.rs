//! Scriptable transport for tests.
//!
//! Results are queued ahead of time and popped per call; every executed
//! command is recorded for assertions. Shared handles (`Arc<Mutex<_>>`) let a
//! test keep inspecting after the mock is boxed into a failover pair or
//! backend. An exhausted script answers with empty success, which keeps
//! steady-state cycle tests short.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::command::RouterCommand;
use crate::transport::{CommandOutput, Transport, TransportError};

type Script = Arc<Mutex<VecDeque<Result<CommandOutput, TransportError>>>>;
type CallLog = Arc<Mutex<Vec<String>>>;

/// Scriptable [`Transport`].
#[derive(Clone)]
pub struct MockTransport {
    name: &'static str,
    script: Script,
    calls: CallLog,
    closed: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Queue a successful response with the given stdout.
    pub fn push_ok(&self, stdout: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(CommandOutput::ok(stdout)));
    }

    /// Queue an error response.
    pub fn push_err(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Handle onto the rendered-CLI call log.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Whether `close()` has been observed.
    pub fn was_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Transport for MockTransport {
    fn run_cmd(&mut self, cmd: &RouterCommand) -> Result<CommandOutput, TransportError> {
        self.calls.lock().unwrap().push(cmd.cli_render());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
