//! Client handle for non-blocking session control
//!
//! All methods send a command to the coordinator task and return
//! immediately; outcomes arrive as `ClientEvent`s.

use tokio::task::JoinHandle;

use super::events::{
    ClientCommand, ClientCommandSender, ClientEventReceiver, ClientSnapshot, SharedClientState,
};

#[derive(Debug, Clone)]
pub struct ClientHandle {
    command_tx: ClientCommandSender,
    state: SharedClientState,
}

impl ClientHandle {
    pub fn new(command_tx: ClientCommandSender, state: SharedClientState) -> Self {
        Self { command_tx, state }
    }

    fn send(&self, command: ClientCommand) {
        let _ = self.command_tx.send(command);
    }

    pub fn setup(&self) {
        self.send(ClientCommand::Setup);
    }

    /// Start, or resume after a pause
    pub fn play(&self) {
        self.send(ClientCommand::Play);
    }

    pub fn pause(&self) {
        self.send(ClientCommand::Pause);
    }

    pub fn teardown(&self) {
        self.send(ClientCommand::Teardown);
    }

    pub fn shutdown(&self) {
        self.send(ClientCommand::Shutdown);
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.state.snapshot()
    }
}

/// Handle plus the coordinator's event stream and task
pub struct ClientThreadHandle {
    pub handle: ClientHandle,
    pub event_rx: Option<ClientEventReceiver>,
    task: JoinHandle<()>,
}

impl ClientThreadHandle {
    pub(super) fn new(
        handle: ClientHandle,
        event_rx: ClientEventReceiver,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            handle,
            event_rx: Some(event_rx),
            task,
        }
    }

    pub fn take_event_rx(&mut self) -> Option<ClientEventReceiver> {
        self.event_rx.take()
    }

    /// Ask the coordinator to shut down and wait for it
    pub async fn join(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!("Client task ended abnormally: {}", e);
        }
    }
}
