mod classify;
mod facts;
mod identity;
mod outcome;

pub use classify::{classify, conflicting_identity, FailureCategory};
pub use facts::{InstalledPackageFacts, LocationClass, OwnerId, UserProfileId};
pub use identity::PackageIdentity;
pub use outcome::{PackageState, RecoveryOutcome, ReplaceError, Step, WorldState};
