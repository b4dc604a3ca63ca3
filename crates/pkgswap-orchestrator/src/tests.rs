use super::*;

use std::cell::RefCell;
use std::path::Path;

use anyhow::Result;
use pkgswap_core::{
    OwnerId, PackageIdentity, PackageState, RecoveryOutcome, ReplaceError, Step, UserProfileId,
    WorldState,
};
use pkgswap_host::{CommandOutput, CommandRunner, HostLayout};

const ARCHIVE: &str = "/data/local/tmp/incoming/new.apk";
const STAGING: &str = "/data/local/tmp/pkgswap/com.example";
const CONFLICT: &str = "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: Existing package com.example signatures do not match newer version]";

/// Scripted host: the first rule whose prefix matches answers the command.
/// A rule is consumed while a later rule with the same prefix remains, so
/// repeated prefixes answer in sequence. Unmatched commands succeed silently.
struct FakeHost {
    rules: RefCell<Vec<(String, CommandOutput)>>,
    log: RefCell<Vec<String>>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            rules: RefCell::new(Vec::new()),
            log: RefCell::new(Vec::new()),
        }
    }

    fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.rules.borrow_mut().push((prefix.to_string(), output));
        self
    }

    fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.log
            .borrow()
            .iter()
            .position(|command| command.starts_with(prefix))
    }

    fn ran(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }
}

impl CommandRunner for FakeHost {
    fn execute(&self, command_lines: &[String]) -> Result<CommandOutput> {
        let joined = command_lines.join(" && ");
        self.log.borrow_mut().push(joined.clone());

        let mut rules = self.rules.borrow_mut();
        let Some(index) = rules
            .iter()
            .position(|(prefix, _)| joined.starts_with(prefix.as_str()))
        else {
            return Ok(CommandOutput::ok(&[]));
        };
        let prefix = rules[index].0.clone();
        let repeated = rules[index + 1..]
            .iter()
            .any(|(other, _)| *other == prefix);
        if repeated {
            return Ok(rules.remove(index).1);
        }
        Ok(rules[index].1.clone())
    }
}

fn dumpsys(app_id: u32, user: u32) -> CommandOutput {
    CommandOutput {
        success: true,
        output_lines: vec![
            "Packages:".to_string(),
            "  Package [com.example] (5f1b3d):".to_string(),
            format!("    userId={app_id}"),
            format!("    User {user}: ceDataInode=4411 installed=true hidden=false"),
        ],
    }
}

/// Install fails on `install_failure` and the archive declares com.example.
fn conflict_prelude(install_failure: &str) -> FakeHost {
    FakeHost::new()
        .on(
            &format!("pm install -d -r '{ARCHIVE}'"),
            CommandOutput::failed(&[install_failure]),
        )
        .on(
            "aapt2 dump badging",
            CommandOutput::ok(&["package: name='com.example' versionCode='7'"]),
        )
}

/// A host where the first install hits a signature conflict and every
/// recovery step succeeds; the reinstall hands the package a new app id.
fn conflicting_host() -> FakeHost {
    conflict_prelude(CONFLICT)
        .on(
            "pm path com.example",
            CommandOutput::ok(&["package:/data/app/~~a1/com.example-b2/base.apk"]),
        )
        .on("dumpsys package com.example", dumpsys(10_123, 0))
        .on("dumpsys package com.example", dumpsys(10_200, 0))
}

fn entered_steps(events: &[ProgressEvent]) -> Vec<Step> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Entered(step) => Some(*step),
            _ => None,
        })
        .collect()
}

fn run(host: &FakeHost) -> (RecoveryOutcome, Vec<ProgressEvent>) {
    let layout = HostLayout::default();
    let mut events = Vec::new();
    let outcome = Orchestrator::new(host, &layout)
        .run(Path::new(ARCHIVE), &mut |event: ProgressEvent| events.push(event));
    (outcome, events)
}

fn identity() -> PackageIdentity {
    PackageIdentity::parse("com.example").expect("identity must parse")
}

#[test]
fn clean_install_needs_no_recovery() {
    let host = FakeHost::new();
    let (outcome, events) = run(&host);

    assert_eq!(outcome, RecoveryOutcome::InstalledCleanly);
    assert_eq!(entered_steps(&events), vec![Step::Installing]);
    assert_eq!(host.log(), vec![format!("pm install -d -r '{ARCHIVE}'")]);
}

#[test]
fn insufficient_storage_stops_without_touching_data() {
    let host = FakeHost::new().on(
        "pm install",
        CommandOutput::failed(&["Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]"]),
    );
    let (outcome, events) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::Installing,
            ReplaceError::Unclassified {
                output: "Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]".to_string(),
            },
            WorldState::untouched(),
        )
    );
    assert_eq!(
        entered_steps(&events),
        vec![Step::Installing, Step::ClassifyingFailure]
    );
    assert_eq!(host.log().len(), 1, "log: {:?}", host.log());
}

#[test]
fn empty_failure_output_is_not_treated_as_conflict() {
    let host = FakeHost::new().on("pm install", CommandOutput::failed(&[]));
    let (outcome, _) = run(&host);

    assert!(matches!(
        outcome,
        RecoveryOutcome::FailedAtStep {
            step: Step::Installing,
            error: ReplaceError::Unclassified { .. },
            ..
        }
    ));
    assert!(!host.ran("aapt"));
}

#[test]
fn signature_conflict_runs_full_recovery() {
    let host = conflicting_host();
    let (outcome, events) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::InstalledWithDataRestored {
            identity: identity()
        }
    );
    assert_eq!(
        entered_steps(&events),
        vec![
            Step::Installing,
            Step::ClassifyingFailure,
            Step::ResolvingIdentity,
            Step::ResolvingFacts,
            Step::BackingUp,
            Step::Uninstalling,
            Step::Reinstalling,
            Step::ResolvingNewOwner,
            Step::Restoring,
        ]
    );
    assert!(events.contains(&ProgressEvent::IdentityResolved(identity())));

    let stop = host.position("am force-stop com.example").expect("app stopped");
    let backup = host
        .position("cp -a '/data/data/com.example'")
        .expect("data backed up");
    let uninstall = host.position("pm uninstall com.example").expect("uninstalled");
    let reinstall = host
        .position(&format!("pm install -d -r -f '{ARCHIVE}'"))
        .expect("reinstalled on internal storage");
    let chown = host
        .position("chown -R 10200:10200 '/data/data/com.example'")
        .expect("new owner applied");
    assert!(stop < backup && backup < uninstall && uninstall < reinstall && reinstall < chown);

    let log = host.log();
    assert_eq!(log.last(), Some(&format!("rm -rf '{STAGING}'")));
}

#[test]
fn identity_unresolvable_stops_before_touching_data() {
    let host = FakeHost::new()
        .on("pm install", CommandOutput::failed(&[CONFLICT]))
        .on(
            "aapt",
            CommandOutput::failed(&["ERROR: dump failed because no AndroidManifest.xml found"]),
        );
    let (outcome, _) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::ResolvingIdentity,
            ReplaceError::IdentityUnresolvable,
            WorldState::untouched(),
        )
    );
    assert!(!host.ran("pm path"));
    assert!(!host.ran("cp -a"));
}

#[test]
fn backup_failure_never_uninstalls() {
    let host = conflicting_host().on(
        "test -d '/data/data/com.example'",
        CommandOutput::failed(&[]),
    );
    let (outcome, _) = run(&host);

    assert!(matches!(
        outcome,
        RecoveryOutcome::FailedAtStep {
            step: Step::BackingUp,
            error: ReplaceError::BackupFailed { .. },
            ..
        }
    ));
    assert!(!host.ran("pm uninstall"));
    assert!(!host.ran("pm install -d -r -f"));
}

#[test]
fn uninstall_failure_discards_snapshot() {
    let host = conflicting_host().on(
        "pm uninstall",
        CommandOutput::failed(&["Failure [DELETE_FAILED_DEVICE_POLICY_MANAGER]"]),
    );
    let (outcome, _) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::Uninstalling,
            ReplaceError::CommandFailed {
                output: "Failure [DELETE_FAILED_DEVICE_POLICY_MANAGER]".to_string(),
            },
            WorldState::untouched(),
        )
    );
    let uninstall = host.position("pm uninstall").expect("uninstall attempted");
    let log = host.log();
    assert_eq!(log[uninstall + 1], format!("rm -rf '{STAGING}'"));
    assert_eq!(log.len(), uninstall + 2);
}

#[test]
fn reinstall_failure_keeps_snapshot_and_reports_absent_package() {
    let host = conflicting_host().on(
        "pm install -d -r -f",
        CommandOutput::failed(&["Failure [INSTALL_FAILED_INTERNAL_ERROR]"]),
    );
    let (outcome, _) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::Reinstalling,
            ReplaceError::CommandFailed {
                output: "Failure [INSTALL_FAILED_INTERNAL_ERROR]".to_string(),
            },
            WorldState {
                package: PackageState::Absent,
                snapshot: Some(STAGING.to_string()),
            },
        )
    );
    let reinstall = host.position("pm install -d -r -f").expect("reinstall attempted");
    assert_eq!(host.log().len(), reinstall + 1, "nothing may run after a failed reinstall");
}

#[test]
fn restore_problem_is_reported_as_warning() {
    let host = conflicting_host().on(
        "chown",
        CommandOutput::failed(&["chown: /data/data/com.example: Operation not permitted"]),
    );
    let (outcome, events) = run(&host);

    let RecoveryOutcome::InstalledWithDataRestoreWarning { identity: restored, warnings } = outcome
    else {
        panic!("expected a restore warning, got {outcome:?}");
    };
    assert_eq!(restored, identity());
    assert!(!warnings.is_empty());
    assert!(events
        .iter()
        .any(|event| matches!(
            event,
            ProgressEvent::Warning(message) if message.contains("owner 10200")
        )));
    assert!(host.ran(&format!("rm -rf '{STAGING}'")));
}

#[test]
fn undetectable_user_profile_defaults_to_primary() {
    let host = conflict_prelude(CONFLICT)
        .on(
            "pm path com.example",
            CommandOutput::ok(&["package:/data/app/~~a1/com.example-b2/base.apk"]),
        )
        .on("dumpsys package", CommandOutput::failed(&["Can't find service: package"]))
        .on("pm list packages", CommandOutput::failed(&[]));
    let (outcome, events) = run(&host);

    assert!(entered_steps(&events).contains(&Step::Restoring));
    let facts = events
        .iter()
        .find_map(|event| match event {
            ProgressEvent::FactsResolved(facts) => Some(facts.clone()),
            _ => None,
        })
        .expect("facts reported");
    assert!(!facts.user_profile_detected);
    assert!(host.ran(&format!("pm install -d -r -f '{ARCHIVE}'")));
    assert!(!host.log().iter().any(|command| command.contains("--user")));
    assert!(matches!(
        outcome,
        RecoveryOutcome::InstalledWithDataRestoreWarning { .. }
    ));
}

#[test]
fn secondary_profile_is_preserved_on_reinstall() {
    let host = conflict_prelude(CONFLICT)
        .on(
            "pm path com.example",
            CommandOutput::ok(&["package:/mnt/expand/77aa/app/com.example-1/base.apk"]),
        )
        .on("dumpsys package com.example", dumpsys(10_123, 10));
    let (outcome, _) = run(&host);

    assert!(outcome.is_installed());
    assert!(host.ran(&format!("pm install -d -r -s --user 10 '{ARCHIVE}'")));
    assert!(host.ran("cp -a '/data/user/10/com.example'"));
    assert!(host.ran("chown -R 1010123:1010123 '/data/user/10/com.example'"));
}

#[test]
fn split_install_and_identity_mismatch_raise_warnings() {
    let host = conflict_prelude(
        "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: Existing package com.other signatures do not match]",
    )
    .on(
        "pm path com.example",
        CommandOutput::ok(&[
            "package:/data/app/~~a1/com.example-b2/base.apk",
            "package:/data/app/~~a1/com.example-b2/split_config.en.apk",
        ]),
    )
    .on("dumpsys package com.example", dumpsys(10_123, 0));
    let (outcome, events) = run(&host);

    assert!(outcome.is_installed());
    let warnings: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Warning(message) => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert!(warnings.iter().any(|message| message.contains("com.other")));
    assert!(warnings
        .iter()
        .any(|message| message.contains("2 split artifacts")));
}

#[test]
fn denied_confirmation_aborts_before_backup() {
    let host = conflicting_host();
    let layout = HostLayout::default();
    let (handle, waiter) = confirmation_channel();
    let mut handle = Some(handle);
    let mut events = Vec::new();

    let outcome = Orchestrator::new(&host, &layout)
        .with_confirmation(waiter)
        .run(Path::new(ARCHIVE), &mut |event: ProgressEvent| {
            if let ProgressEvent::ConfirmationRequested { .. } = &event {
                if let Some(handle) = handle.take() {
                    handle.fulfill(Decision::Deny);
                }
            }
            events.push(event);
        });

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::AwaitingConfirmation,
            ReplaceError::Aborted,
            WorldState::untouched(),
        )
    );
    assert!(entered_steps(&events).contains(&Step::AwaitingConfirmation));
    assert!(!host.ran("am force-stop"));
    assert!(!host.ran("cp -a"));
}

#[test]
fn approved_confirmation_resumes_recovery() {
    let host = conflicting_host();
    let layout = HostLayout::default();
    let (handle, waiter) = confirmation_channel();
    let approver = std::thread::spawn(move || handle.fulfill(Decision::Approve));

    let outcome = Orchestrator::new(&host, &layout)
        .with_confirmation(waiter)
        .run(Path::new(ARCHIVE), &mut |_event: ProgressEvent| {});
    approver.join().expect("approver thread");

    assert_eq!(
        outcome,
        RecoveryOutcome::InstalledWithDataRestored {
            identity: identity()
        }
    );
}

#[test]
fn dropped_confirmation_handle_aborts() {
    let host = conflicting_host();
    let layout = HostLayout::default();
    let (handle, waiter) = confirmation_channel();
    drop(handle);

    let outcome = Orchestrator::new(&host, &layout)
        .with_confirmation(waiter)
        .run(Path::new(ARCHIVE), &mut |_event: ProgressEvent| {});

    assert!(matches!(
        outcome,
        RecoveryOutcome::FailedAtStep {
            step: Step::AwaitingConfirmation,
            error: ReplaceError::Aborted,
            ..
        }
    ));
}

#[test]
fn cancel_after_backup_keeps_snapshot() {
    let host = conflicting_host();
    let layout = HostLayout::default();
    let cancel = CancelFlag::default();
    let trigger = cancel.clone();

    let outcome = Orchestrator::new(&host, &layout)
        .with_cancel(cancel)
        .run(Path::new(ARCHIVE), &mut |event: ProgressEvent| {
            if let ProgressEvent::SnapshotStaged(_) = event {
                trigger.cancel();
            }
        });

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::Uninstalling,
            ReplaceError::Aborted,
            WorldState {
                package: PackageState::Original,
                snapshot: Some(STAGING.to_string()),
            },
        )
    );
    assert!(!host.ran("pm uninstall"));
    let backup = host.position("cp -a").expect("backup ran");
    assert!(
        !host.log()[backup..]
            .iter()
            .any(|command| command == &format!("rm -rf '{STAGING}'")),
        "snapshot must survive cancellation"
    );
}

#[test]
fn cancel_after_reinstall_reports_replaced_package() {
    let host = conflicting_host();
    let layout = HostLayout::default();
    let cancel = CancelFlag::default();
    let trigger = cancel.clone();

    let outcome = Orchestrator::new(&host, &layout)
        .with_cancel(cancel)
        .run(Path::new(ARCHIVE), &mut |event: ProgressEvent| {
            if event == ProgressEvent::Entered(Step::Reinstalling) {
                trigger.cancel();
            }
        });

    assert_eq!(
        outcome,
        RecoveryOutcome::failed(
            Step::ResolvingNewOwner,
            ReplaceError::Aborted,
            WorldState {
                package: PackageState::Replaced,
                snapshot: Some(STAGING.to_string()),
            },
        )
    );
}

#[test]
fn journal_claim_is_exclusive_per_identity() {
    let state = tempfile::tempdir().expect("must create tempdir");
    let journal = RunJournal::new(state.path());

    let run = journal
        .claim(&identity(), Path::new(ARCHIVE))
        .expect("first claim succeeds");
    assert_eq!(run.identity, identity());
    assert_eq!(run.archive, ARCHIVE);

    let err = journal
        .claim(&identity(), Path::new(ARCHIVE))
        .expect_err("second claim must fail");
    assert!(
        err.to_string()
            .contains("a replacement run for com.example is already recorded"),
        "unexpected error: {err}"
    );

    journal.release(&identity()).expect("release succeeds");
    assert!(journal.list_active().expect("list runs").is_empty());
    journal
        .claim(&identity(), Path::new(ARCHIVE))
        .expect("claim after release succeeds");
}

#[test]
fn journal_observer_records_steps_and_keeps_dangling_snapshot() {
    let state = tempfile::tempdir().expect("must create tempdir");
    let journal = RunJournal::new(state.path());
    journal
        .claim(&identity(), Path::new(ARCHIVE))
        .expect("claim succeeds");

    let host = conflicting_host().on(
        "pm install -d -r -f",
        CommandOutput::failed(&["Failure [INSTALL_FAILED_INTERNAL_ERROR]"]),
    );
    let layout = HostLayout::default();
    let mut observer = JournalObserver::new(&journal, identity(), |_event: ProgressEvent| {});
    let outcome = Orchestrator::new(&host, &layout).run(Path::new(ARCHIVE), &mut observer);
    journal
        .finish(&identity(), &outcome)
        .expect("finish succeeds");

    let runs = journal.list_active().expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].last_step.as_deref(), Some("reinstalling"));
    assert_eq!(runs[0].snapshot.as_deref(), Some(STAGING));
    assert_eq!(runs[0].user, Some(UserProfileId::PRIMARY));
    assert_eq!(runs[0].previous_owner, Some(OwnerId(10_123)));
    assert_eq!(
        journal.active(&identity()).expect("read marker"),
        Some(runs[0].clone())
    );

    let entries = journal.read_entries(&identity()).expect("read journal");
    let events: Vec<_> = entries.iter().map(|entry| entry.event.as_str()).collect();
    assert_eq!(events.first(), Some(&"installing"));
    assert!(events.contains(&"snapshot"));
    assert_eq!(events.last(), Some(&"reinstalling"));
    assert!(entries.windows(2).all(|pair| pair[0].seq + 1 == pair[1].seq));
}

#[test]
fn journal_finish_releases_completed_run() {
    let state = tempfile::tempdir().expect("must create tempdir");
    let journal = RunJournal::new(state.path());
    journal
        .claim(&identity(), Path::new(ARCHIVE))
        .expect("claim succeeds");

    journal
        .finish(
            &identity(),
            &RecoveryOutcome::InstalledWithDataRestored {
                identity: identity(),
            },
        )
        .expect("finish succeeds");
    assert!(!journal.marker_path(&identity()).exists());
    assert!(journal.list_active().expect("list runs").is_empty());
    assert_eq!(journal.active(&identity()).expect("no marker is fine"), None);
}

#[test]
fn owner_id_falls_back_to_previous_owner() {
    let host = conflict_prelude(CONFLICT)
        .on(
            "pm path com.example",
            CommandOutput::ok(&["package:/data/app/~~a1/com.example-b2/base.apk"]),
        )
        .on("dumpsys package com.example", dumpsys(10_123, 0))
        .on("dumpsys package com.example", CommandOutput::failed(&[]))
        .on("pm list packages", CommandOutput::failed(&[]));
    let (outcome, events) = run(&host);

    assert_eq!(
        outcome,
        RecoveryOutcome::InstalledWithDataRestored {
            identity: identity()
        }
    );
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::Warning(message) if message.contains("reusing the previous owner")
    )));
    let owner = OwnerId(10_123);
    assert!(host.ran(&format!("chown -R {owner}:{owner} '/data/data/com.example'")));
}
