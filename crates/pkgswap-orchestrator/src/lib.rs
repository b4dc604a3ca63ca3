mod confirm;
mod journal;
mod machine;
mod progress;

pub use confirm::{confirmation_channel, ConfirmationHandle, ConfirmationWaiter, Decision};
pub use journal::{ActiveRun, JournalEntry, JournalObserver, RunJournal};
pub use machine::{CancelFlag, Orchestrator, ReplaceOptions};
pub use progress::{ProgressEvent, ProgressObserver};

#[cfg(test)]
mod tests;
