use std::fmt;

use serde::Serialize;

use crate::PackageIdentity;

/// Named phases of one replacement run, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Installing,
    ClassifyingFailure,
    ResolvingIdentity,
    ResolvingFacts,
    AwaitingConfirmation,
    BackingUp,
    Uninstalling,
    Reinstalling,
    ResolvingNewOwner,
    Restoring,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::ClassifyingFailure => "classifying-failure",
            Self::ResolvingIdentity => "resolving-identity",
            Self::ResolvingFacts => "resolving-facts",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::BackingUp => "backing-up",
            Self::Uninstalling => "uninstalling",
            Self::Reinstalling => "reinstalling",
            Self::ResolvingNewOwner => "resolving-new-owner",
            Self::Restoring => "restoring",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaceError {
    #[error("privileged command failed: {output}")]
    CommandFailed { output: String },
    #[error("install failed for an unrecognised reason: {output}")]
    Unclassified { output: String },
    #[error("could not resolve a package identity from the archive")]
    IdentityUnresolvable,
    #[error("data backup failed: {reason}")]
    BackupFailed { reason: String },
    #[error("data restore incomplete: {}", .warnings.join("; "))]
    RestoreIncomplete { warnings: Vec<String> },
    #[error("run aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    /// Whatever was installed before the run is still installed.
    Original,
    /// The old package was removed and the new one is not installed.
    Absent,
    /// The new package is installed but its data was not restored.
    Replaced,
}

/// What remains true on the host after a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorldState {
    pub package: PackageState,
    /// Staging directory still holding the private data, when one was kept.
    pub snapshot: Option<String>,
}

impl WorldState {
    pub fn untouched() -> Self {
        Self {
            package: PackageState::Original,
            snapshot: None,
        }
    }

    pub fn describe(&self) -> String {
        let package = match self.package {
            PackageState::Original => "the original installation is untouched",
            PackageState::Absent => "the application is currently uninstalled",
            PackageState::Replaced => "the new package is installed without its previous data",
        };
        match &self.snapshot {
            Some(snapshot) => format!("{package}; saved data remains at {snapshot}"),
            None => package.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    InstalledCleanly,
    InstalledWithDataRestored {
        identity: PackageIdentity,
    },
    InstalledWithDataRestoreWarning {
        identity: PackageIdentity,
        warnings: Vec<String>,
    },
    FailedAtStep {
        step: Step,
        error: ReplaceError,
        world: WorldState,
    },
}

impl RecoveryOutcome {
    pub fn failed(step: Step, error: ReplaceError, world: WorldState) -> Self {
        Self::FailedAtStep { step, error, world }
    }

    /// True for every outcome where the new package ended up installed.
    pub fn is_installed(&self) -> bool {
        !matches!(self, Self::FailedAtStep { .. })
    }
}
