use super::job::HookEvent;
use crate::server_store::ServerStore;
use crate::tree_store::TreeStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// The shared record tree that maintenance works on.
    pub tree_store: Arc<dyn TreeStore>,

    /// Job history, schedules and the audit log.
    pub server_store: Arc<dyn ServerStore>,

    /// Lets a job fire hooks for other jobs. `None` outside the scheduler.
    pub hook_sender: Option<mpsc::Sender<HookEvent>>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        tree_store: Arc<dyn TreeStore>,
        server_store: Arc<dyn ServerStore>,
    ) -> Self {
        Self {
            cancellation_token,
            tree_store,
            server_store,
            hook_sender: None,
        }
    }

    pub fn with_hook_sender(mut self, hook_sender: mpsc::Sender<HookEvent>) -> Self {
        self.hook_sender = Some(hook_sender);
        self
    }

    /// Copy of this context bound to a different cancellation token.
    pub fn with_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Fire a hook without blocking. Dropped if no scheduler is listening or
    /// the channel is full.
    pub fn emit_hook(&self, event: HookEvent) -> bool {
        match &self.hook_sender {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }
}
