use pkgswap_core::{InstalledPackageFacts, PackageIdentity, Step};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A state was entered; emitted once per state, in order.
    Entered(Step),
    IdentityResolved(PackageIdentity),
    FactsResolved(InstalledPackageFacts),
    /// The run is paused until the confirmation handle is fulfilled.
    ConfirmationRequested {
        identity: PackageIdentity,
        facts: InstalledPackageFacts,
    },
    SnapshotStaged(String),
    Warning(String),
}

pub trait ProgressObserver {
    fn observe(&mut self, event: ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: FnMut(ProgressEvent),
{
    fn observe(&mut self, event: ProgressEvent) {
        self(event)
    }
}
