use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pkgswap_core::{
    classify, conflicting_identity, FailureCategory, InstalledPackageFacts, LocationClass,
    OwnerId, PackageIdentity, PackageState, RecoveryOutcome, ReplaceError, Step, UserProfileId,
    WorldState,
};
use pkgswap_host::{
    build_force_stop_command, build_install_command, build_uninstall_command, CommandOutput,
    CommandRunner, DataSnapshot, DataSnapshotManager, HostLayout, MetadataResolver,
    DEFAULT_ARCHIVE_TOOLS,
};
use tracing::{debug, info, warn};

use crate::{ConfirmationWaiter, Decision, ProgressEvent, ProgressObserver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOptions {
    /// Stop the application before its data is copied.
    pub force_stop: bool,
    /// Re-apply security labels after data is restored.
    pub relabel: bool,
    pub archive_tools: Vec<String>,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self {
            force_stop: true,
            relabel: true,
            archive_tools: DEFAULT_ARCHIVE_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
        }
    }
}

/// Shared flag a caller sets to stop a run at the next state boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum State {
    Installing,
    ClassifyingFailure {
        output: CommandOutput,
    },
    ResolvingIdentity {
        install_output: CommandOutput,
    },
    ResolvingFacts {
        identity: PackageIdentity,
    },
    AwaitingConfirmation {
        identity: PackageIdentity,
        facts: InstalledPackageFacts,
    },
    BackingUp {
        identity: PackageIdentity,
        facts: InstalledPackageFacts,
    },
    Uninstalling {
        facts: InstalledPackageFacts,
        snapshot: DataSnapshot,
    },
    Reinstalling {
        facts: InstalledPackageFacts,
        snapshot: DataSnapshot,
    },
    ResolvingNewOwner {
        facts: InstalledPackageFacts,
        snapshot: DataSnapshot,
    },
    Restoring {
        snapshot: DataSnapshot,
        owner: Option<OwnerId>,
    },
    Done(RecoveryOutcome),
}

impl State {
    /// Step this state executes, or the outcome once the run is finished.
    fn begin(self) -> Result<(Step, Self), RecoveryOutcome> {
        let step = match self {
            Self::Done(outcome) => return Err(outcome),
            Self::Installing => Step::Installing,
            Self::ClassifyingFailure { .. } => Step::ClassifyingFailure,
            Self::ResolvingIdentity { .. } => Step::ResolvingIdentity,
            Self::ResolvingFacts { .. } => Step::ResolvingFacts,
            Self::AwaitingConfirmation { .. } => Step::AwaitingConfirmation,
            Self::BackingUp { .. } => Step::BackingUp,
            Self::Uninstalling { .. } => Step::Uninstalling,
            Self::Reinstalling { .. } => Step::Reinstalling,
            Self::ResolvingNewOwner { .. } => Step::ResolvingNewOwner,
            Self::Restoring { .. } => Step::Restoring,
        };
        Ok((step, self))
    }

    /// What is true on the host if the run stops before this state executes.
    fn world_before(&self) -> WorldState {
        let (package, snapshot) = match self {
            Self::Uninstalling { snapshot, .. } => (PackageState::Original, Some(snapshot)),
            Self::Reinstalling { snapshot, .. } => (PackageState::Absent, Some(snapshot)),
            Self::ResolvingNewOwner { snapshot, .. } | Self::Restoring { snapshot, .. } => {
                (PackageState::Replaced, Some(snapshot))
            }
            _ => (PackageState::Original, None),
        };
        WorldState {
            package,
            snapshot: snapshot.map(|snapshot| snapshot.staging_dir.display().to_string()),
        }
    }
}

/// Drives one replacement run from the first install attempt to a terminal
/// outcome. Every state either hands over to its successor or finishes the
/// run; no state is entered twice.
pub struct Orchestrator<'a, R: ?Sized> {
    runner: &'a R,
    layout: &'a HostLayout,
    options: ReplaceOptions,
    confirmation: Option<ConfirmationWaiter>,
    cancel: CancelFlag,
}

struct Run<'r, 'a, R: ?Sized, O> {
    orchestrator: &'r mut Orchestrator<'a, R>,
    archive: PathBuf,
    observer: &'r mut O,
}

impl<'a, R> Orchestrator<'a, R>
where
    R: CommandRunner + ?Sized,
{
    pub fn new(runner: &'a R, layout: &'a HostLayout) -> Self {
        Self {
            runner,
            layout,
            options: ReplaceOptions::default(),
            confirmation: None,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_options(mut self, options: ReplaceOptions) -> Self {
        self.options = options;
        self
    }

    /// Pauses the run before any data is touched until the matching
    /// handle is fulfilled.
    pub fn with_confirmation(mut self, waiter: ConfirmationWaiter) -> Self {
        self.confirmation = Some(waiter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run<O>(mut self, archive: &Path, observer: &mut O) -> RecoveryOutcome
    where
        O: ProgressObserver,
    {
        let mut run = Run {
            orchestrator: &mut self,
            archive: archive.to_path_buf(),
            observer,
        };

        let mut state = State::Installing;
        loop {
            let (step, live) = match state.begin() {
                Ok(next) => next,
                Err(outcome) => return outcome,
            };
            if run.orchestrator.cancel.is_cancelled() {
                warn!(%step, "run cancelled");
                return RecoveryOutcome::failed(step, ReplaceError::Aborted, live.world_before());
            }
            debug!(%step, "entering state");
            run.observer.observe(ProgressEvent::Entered(step));
            state = run.advance(live);
        }
    }
}

impl<'r, 'a, R, O> Run<'r, 'a, R, O>
where
    R: CommandRunner + ?Sized,
    O: ProgressObserver,
{
    fn advance(&mut self, state: State) -> State {
        match state {
            State::Installing => self.install(),
            State::ClassifyingFailure { output } => self.classify_failure(output),
            State::ResolvingIdentity { install_output } => self.resolve_identity(install_output),
            State::ResolvingFacts { identity } => self.resolve_facts(identity),
            State::AwaitingConfirmation { identity, facts } => {
                self.await_confirmation(identity, facts)
            }
            State::BackingUp { identity, facts } => self.back_up(identity, facts),
            State::Uninstalling { facts, snapshot } => self.uninstall(facts, snapshot),
            State::Reinstalling { facts, snapshot } => self.reinstall(facts, snapshot),
            State::ResolvingNewOwner { facts, snapshot } => {
                self.resolve_new_owner(facts, snapshot)
            }
            State::Restoring { snapshot, owner } => self.restore(snapshot, owner),
            State::Done(outcome) => State::Done(outcome),
        }
    }

    fn install(&mut self) -> State {
        let command = build_install_command(&self.archive, LocationClass::Unspecified, None);
        let output = self.execute(command);
        if output.success {
            info!(archive = %self.archive.display(), "installed without recovery");
            return State::Done(RecoveryOutcome::InstalledCleanly);
        }
        State::ClassifyingFailure { output }
    }

    fn classify_failure(&mut self, output: CommandOutput) -> State {
        match classify(&output.output_lines) {
            FailureCategory::SignatureConflict => {
                info!("install failed on a signature conflict, preserving data");
                State::ResolvingIdentity {
                    install_output: output,
                }
            }
            FailureCategory::OtherFailure => State::Done(RecoveryOutcome::failed(
                Step::Installing,
                ReplaceError::Unclassified {
                    output: output.joined(),
                },
                WorldState::untouched(),
            )),
        }
    }

    fn resolve_identity(&mut self, install_output: CommandOutput) -> State {
        let resolver = MetadataResolver::new(self.orchestrator.runner)
            .with_archive_tools(self.orchestrator.options.archive_tools.clone());
        let Some(identity) = resolver.identity_of(&self.archive) else {
            return State::Done(RecoveryOutcome::failed(
                Step::ResolvingIdentity,
                ReplaceError::IdentityUnresolvable,
                WorldState::untouched(),
            ));
        };

        if let Some(reported) = conflicting_identity(&install_output.output_lines) {
            if reported != identity {
                self.warn(format!(
                    "installer reported a conflict with {reported}, but the archive declares {identity}"
                ));
            }
        }
        self.observer
            .observe(ProgressEvent::IdentityResolved(identity.clone()));
        State::ResolvingFacts { identity }
    }

    fn resolve_facts(&mut self, identity: PackageIdentity) -> State {
        let resolver = MetadataResolver::new(self.orchestrator.runner);
        let facts = resolver.facts_of(&identity).unwrap_or_else(|| {
            self.warn(format!(
                "{identity} is not reported as installed; using default placement"
            ));
            InstalledPackageFacts {
                install_paths: Vec::new(),
                location_class: LocationClass::Unspecified,
                user_profile_id: UserProfileId::PRIMARY,
                user_profile_detected: false,
                owner_id: None,
            }
        });
        if facts.is_split() {
            self.warn(format!(
                "{identity} is installed as {} split artifacts; only the artifacts in the new archive will be installed",
                facts.install_paths.len()
            ));
        }

        self.observer
            .observe(ProgressEvent::FactsResolved(facts.clone()));
        if self.orchestrator.confirmation.is_some() {
            return State::AwaitingConfirmation { identity, facts };
        }
        State::BackingUp { identity, facts }
    }

    fn await_confirmation(
        &mut self,
        identity: PackageIdentity,
        facts: InstalledPackageFacts,
    ) -> State {
        let Some(waiter) = self.orchestrator.confirmation.take() else {
            return State::BackingUp { identity, facts };
        };
        self.observer.observe(ProgressEvent::ConfirmationRequested {
            identity: identity.clone(),
            facts: facts.clone(),
        });

        match waiter.wait() {
            Some(Decision::Approve) => State::BackingUp { identity, facts },
            Some(Decision::Deny) | None => {
                info!(%identity, "replacement not confirmed");
                State::Done(RecoveryOutcome::failed(
                    Step::AwaitingConfirmation,
                    ReplaceError::Aborted,
                    WorldState::untouched(),
                ))
            }
        }
    }

    fn back_up(&mut self, identity: PackageIdentity, facts: InstalledPackageFacts) -> State {
        if self.orchestrator.options.force_stop {
            let stopped = self.execute(build_force_stop_command(&identity));
            if !stopped.success {
                self.warn(format!("could not stop {identity} before backup"));
            }
        }

        match self.snapshots().snapshot(&identity, facts.user_profile_id) {
            Ok(snapshot) => {
                self.observer.observe(ProgressEvent::SnapshotStaged(
                    snapshot.staging_dir.display().to_string(),
                ));
                State::Uninstalling { facts, snapshot }
            }
            Err(err) => State::Done(RecoveryOutcome::failed(
                Step::BackingUp,
                err,
                WorldState::untouched(),
            )),
        }
    }

    fn uninstall(&mut self, facts: InstalledPackageFacts, snapshot: DataSnapshot) -> State {
        let output = self.execute(build_uninstall_command(&snapshot.identity));
        if output.success {
            return State::Reinstalling { facts, snapshot };
        }

        let world = match self.snapshots().discard(&snapshot.identity) {
            Ok(()) => WorldState::untouched(),
            Err(err) => {
                warn!(identity = %snapshot.identity, "{err:#}");
                WorldState {
                    package: PackageState::Original,
                    snapshot: Some(snapshot.staging_dir.display().to_string()),
                }
            }
        };
        State::Done(RecoveryOutcome::failed(
            Step::Uninstalling,
            ReplaceError::CommandFailed {
                output: output.joined(),
            },
            world,
        ))
    }

    fn reinstall(&mut self, facts: InstalledPackageFacts, snapshot: DataSnapshot) -> State {
        let user = Some(facts.user_profile_id).filter(|user| !user.is_primary());
        let command = build_install_command(&self.archive, facts.location_class, user);
        let output = self.execute(command);
        if output.success {
            return State::ResolvingNewOwner { facts, snapshot };
        }

        // The old package is gone; the staged data is the only copy left.
        warn!(
            identity = %snapshot.identity,
            staging = %snapshot.staging_dir.display(),
            "reinstall failed, application is currently uninstalled"
        );
        State::Done(RecoveryOutcome::failed(
            Step::Reinstalling,
            ReplaceError::CommandFailed {
                output: output.joined(),
            },
            WorldState {
                package: PackageState::Absent,
                snapshot: Some(snapshot.staging_dir.display().to_string()),
            },
        ))
    }

    fn resolve_new_owner(&mut self, facts: InstalledPackageFacts, snapshot: DataSnapshot) -> State {
        let resolver = MetadataResolver::new(self.orchestrator.runner);
        let owner = match resolver.owner_id_of(&snapshot.identity, snapshot.user) {
            Some(owner) => {
                if facts.owner_id.is_some_and(|previous| previous != owner) {
                    info!(identity = %snapshot.identity, %owner, "owner id changed on reinstall");
                }
                Some(owner)
            }
            None => {
                self.warn(format!(
                    "could not determine the new owner of {}; reusing the previous owner",
                    snapshot.identity
                ));
                facts.owner_id
            }
        };
        State::Restoring { snapshot, owner }
    }

    fn restore(&mut self, snapshot: DataSnapshot, owner: Option<OwnerId>) -> State {
        let manager = self.snapshots();
        let report = manager.restore(&snapshot, owner);
        if let Err(err) = manager.discard(&snapshot.identity) {
            warn!(identity = %snapshot.identity, "{err:#}");
        }

        let identity = snapshot.identity;
        if report.is_complete() {
            return State::Done(RecoveryOutcome::InstalledWithDataRestored { identity });
        }
        for warning in &report.warnings {
            self.observer.observe(ProgressEvent::Warning(warning.clone()));
        }
        State::Done(RecoveryOutcome::InstalledWithDataRestoreWarning {
            identity,
            warnings: report.warnings,
        })
    }

    fn snapshots(&self) -> DataSnapshotManager<'a, R> {
        DataSnapshotManager::new(self.orchestrator.runner, self.orchestrator.layout)
            .with_relabel(self.orchestrator.options.relabel)
    }

    fn execute(&mut self, command: String) -> CommandOutput {
        match self.orchestrator.runner.execute(&[command]) {
            Ok(output) => output,
            Err(err) => CommandOutput {
                success: false,
                output_lines: vec![format!("{err:#}")],
            },
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.observer.observe(ProgressEvent::Warning(message));
    }
}
