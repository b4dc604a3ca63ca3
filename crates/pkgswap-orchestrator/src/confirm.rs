use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

/// Caller side of the confirmation signal. Fulfilling consumes the handle,
/// so a decision is delivered at most once; dropping it unfulfilled aborts
/// the waiting run.
#[derive(Debug)]
pub struct ConfirmationHandle {
    sender: SyncSender<Decision>,
}

/// Orchestrator side of the confirmation signal.
#[derive(Debug)]
pub struct ConfirmationWaiter {
    receiver: Receiver<Decision>,
}

pub fn confirmation_channel() -> (ConfirmationHandle, ConfirmationWaiter) {
    let (sender, receiver) = sync_channel(1);
    (ConfirmationHandle { sender }, ConfirmationWaiter { receiver })
}

impl ConfirmationHandle {
    pub fn fulfill(self, decision: Decision) {
        // The run may already be gone; nothing is waiting for the answer then.
        let _ = self.sender.send(decision);
    }
}

impl ConfirmationWaiter {
    /// Blocks until the caller decides. `None` when the handle was dropped.
    pub fn wait(self) -> Option<Decision> {
        self.receiver.recv().ok()
    }
}
