use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use pkgswap_core::{OwnerId, PackageIdentity, RecoveryOutcome, ReplaceError, UserProfileId};
use pkgswap_host::{CommandRunner, DataSnapshotManager, MetadataResolver};
use pkgswap_orchestrator::{confirmation_channel, JournalObserver, Orchestrator, RunJournal};
use serde::Serialize;
use tracing::{info, warn};

use crate::completion::write_completions_script;
use crate::config::PkgswapConfig;
use crate::render::{
    format_facts_lines, format_outcome_lines, format_run_lines, render_section_header,
    render_status_line, OutputStyle, TerminalObserver,
};
use crate::{Cli, Commands};

pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout().lock();
        write_completions_script(shell, &mut stdout)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = PkgswapConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, cli.shell.as_deref(), cli.state_dir)?;
    let runner = config.runner()?;
    let journal = RunJournal::new(config.state_dir()?);
    let output = CliOutput {
        json: cli.json,
        style: OutputStyle::detect(cli.json),
    };
    let mut stdout = std::io::stdout().lock();

    let healthy = match cli.command {
        Commands::Install { archive, yes } => {
            let confirm = !yes;
            install_with_runner(
                &runner,
                &config,
                &journal,
                &archive,
                confirm,
                output,
                &mut stdout,
            )?
        }
        Commands::Facts { identity } => {
            let identity = PackageIdentity::parse(&identity)?;
            facts_with_runner(&runner, &identity, output, &mut stdout)?
        }
        Commands::Doctor => doctor_with_runner(&runner, &config, output, &mut stdout)?,
        Commands::Status => {
            let runs = journal.list_active()?;
            if output.json {
                write_json(&mut stdout, &runs)?;
            } else {
                write_lines(&mut stdout, &format_run_lines(&runs))?;
            }
            true
        }
        Commands::Restore {
            identity,
            owner,
            user,
        } => {
            let identity = PackageIdentity::parse(&identity)?;
            let target = RestoreTarget {
                identity,
                user: user.map(UserProfileId),
                owner: owner.map(OwnerId),
            };
            restore_with_runner(&runner, &config, &journal, &target, output, &mut stdout)?
        }
        Commands::Discard { identity } => {
            let identity = PackageIdentity::parse(&identity)?;
            discard_with_runner(&runner, &config, &journal, &identity, output, &mut stdout)?;
            true
        }
        Commands::Completions { .. } => true,
    };

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CliOutput {
    pub json: bool,
    pub style: OutputStyle,
}

pub fn apply_overrides(
    config: &mut PkgswapConfig,
    shell: Option<&str>,
    state_dir: Option<PathBuf>,
) -> Result<()> {
    if let Some(shell) = shell {
        config.shell = shell.split_whitespace().map(str::to_string).collect();
    }
    if let Some(state_dir) = state_dir {
        config.state_dir = Some(state_dir);
    }
    config.validate()
}

/// Runs one replacement of `archive`. Returns whether the new package ended
/// up installed.
pub fn install_with_runner<R, W>(
    runner: &R,
    config: &PkgswapConfig,
    journal: &RunJournal,
    archive: &Path,
    confirm: bool,
    output: CliOutput,
    out: &mut W,
) -> Result<bool>
where
    R: CommandRunner + ?Sized,
    W: Write,
{
    let layout = config.layout();
    let identity = MetadataResolver::new(runner)
        .with_archive_tools(config.archive_tools.clone())
        .identity_of(archive);
    match &identity {
        Some(identity) => {
            journal.claim(identity, archive)?;
        }
        None => warn!(
            archive = %archive.display(),
            "archive identity unknown up front, run is not journaled"
        ),
    }

    let mut orchestrator =
        Orchestrator::new(runner, &layout).with_options(config.replace_options());
    let mut handle = None;
    if confirm {
        let (confirmation, waiter) = confirmation_channel();
        handle = Some(confirmation);
        orchestrator = orchestrator.with_confirmation(waiter);
    }
    let terminal = TerminalObserver::new(output.style, handle);

    let (outcome, elapsed) = match &identity {
        Some(identity) => {
            let mut observer = JournalObserver::new(journal, identity.clone(), terminal);
            let outcome = orchestrator.run(archive, &mut observer);
            let elapsed = observer.into_inner().finish();
            if let Err(err) = journal.finish(identity, &outcome) {
                warn!(%identity, "failed to close run journal: {err:#}");
            }
            (outcome, elapsed)
        }
        None => {
            let mut observer = terminal;
            let outcome = orchestrator.run(archive, &mut observer);
            (outcome, observer.finish())
        }
    };
    info!(elapsed = %TerminalObserver::elapsed_label(elapsed), "run finished");

    write_outcome(out, output, &outcome)?;
    Ok(outcome.is_installed())
}

pub fn write_outcome<W: Write>(
    out: &mut W,
    output: CliOutput,
    outcome: &RecoveryOutcome,
) -> Result<()> {
    if output.json {
        return write_json(out, outcome);
    }
    write_lines(out, &format_outcome_lines(output.style, outcome))
}

pub fn facts_with_runner<R, W>(
    runner: &R,
    identity: &PackageIdentity,
    output: CliOutput,
    out: &mut W,
) -> Result<bool>
where
    R: CommandRunner + ?Sized,
    W: Write,
{
    let Some(facts) = MetadataResolver::new(runner).facts_of(identity) else {
        return Err(anyhow!("{identity} is not installed on the host"));
    };
    if output.json {
        write_json(out, &facts)?;
    } else {
        write_lines(out, &format_facts_lines(identity, &facts))?;
        if facts.is_split() {
            let warning = "split install; a replacement only carries the artifacts in its archive";
            write_lines(out, &[render_status_line(output.style, "warn", warning)])?;
        }
    }
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoctorCheck {
    pub status: &'static str,
    pub message: String,
}

/// Privilege and tooling checks. Healthy when the shell runs as root and at
/// least one archive tool is available.
pub fn doctor_checks<R>(runner: &R, config: &PkgswapConfig) -> (Vec<DoctorCheck>, bool)
where
    R: CommandRunner + ?Sized,
{
    let mut checks = Vec::new();
    let shell = config.shell.join(" ");

    let privileged = match runner.execute(&["id -u".to_string()]) {
        Ok(output) if output.success => {
            let uid = output
                .output_lines
                .first()
                .map(|line| line.trim().to_string())
                .unwrap_or_default();
            if uid == "0" {
                checks.push(check("ok", format!("shell '{shell}' runs as root")));
                true
            } else {
                checks.push(check(
                    "fail",
                    format!("shell '{shell}' is not privileged (uid {uid})"),
                ));
                false
            }
        }
        Ok(output) => {
            checks.push(check(
                "fail",
                format!("shell '{shell}' failed: {}", output.joined()),
            ));
            false
        }
        Err(err) => {
            checks.push(check("fail", format!("{err:#}")));
            false
        }
    };

    let mut any_tool = false;
    for tool in &config.archive_tools {
        let found = runner
            .execute(&[format!("command -v {tool}")])
            .map(|output| output.success)
            .unwrap_or(false);
        if found {
            any_tool = true;
            checks.push(check("ok", format!("archive tool '{tool}' available")));
        } else {
            checks.push(check("warn", format!("archive tool '{tool}' not found")));
        }
    }
    if !any_tool {
        checks.push(check(
            "fail",
            "no archive tool available; archive identities cannot be read".to_string(),
        ));
    }

    checks.push(check(
        "..",
        format!("staging root: {}", config.staging_root.display()),
    ));
    (checks, privileged && any_tool)
}

fn check(status: &'static str, message: String) -> DoctorCheck {
    DoctorCheck { status, message }
}

pub fn doctor_with_runner<R, W>(
    runner: &R,
    config: &PkgswapConfig,
    output: CliOutput,
    out: &mut W,
) -> Result<bool>
where
    R: CommandRunner + ?Sized,
    W: Write,
{
    let (checks, healthy) = doctor_checks(runner, config);
    if output.json {
        write_json(out, &checks)?;
        return Ok(healthy);
    }

    if let Some(header) = render_section_header(output.style, "doctor") {
        write_lines(out, &[header])?;
    }
    let lines: Vec<String> = checks
        .iter()
        .map(|check| render_status_line(output.style, check.status, &check.message))
        .collect();
    write_lines(out, &lines)?;
    Ok(healthy)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub identity: PackageIdentity,
    pub user: Option<UserProfileId>,
    pub owner: Option<OwnerId>,
}

/// Restores a snapshot left behind by an interrupted run into the profile it
/// was taken from. The snapshot and its run marker are removed only after a
/// complete restore.
pub fn restore_with_runner<R, W>(
    runner: &R,
    config: &PkgswapConfig,
    journal: &RunJournal,
    target: &RestoreTarget,
    output: CliOutput,
    out: &mut W,
) -> Result<bool>
where
    R: CommandRunner + ?Sized,
    W: Write,
{
    let identity = &target.identity;
    let recorded = journal.active(identity)?.and_then(|run| run.user);
    let user = restore_profile(identity, target.user, recorded)?;
    let layout = config.layout();
    let manager = DataSnapshotManager::new(runner, &layout).with_relabel(config.relabel);
    let Some(snapshot) = manager.locate(identity, user) else {
        return Err(anyhow!(
            "no saved data for {identity} at {}",
            layout.staging_dir(identity).display()
        ));
    };

    let owner = target
        .owner
        .or_else(|| MetadataResolver::new(runner).owner_id_of(identity, user))
        .ok_or_else(|| {
            anyhow!("could not determine the owner of {identity}; pass --owner <uid>")
        })?;

    let report = manager.restore(&snapshot, Some(owner));
    if !report.is_complete() {
        let err = ReplaceError::RestoreIncomplete {
            warnings: report.warnings,
        };
        let message = format!("{err}; saved data kept at {}", snapshot.staging_dir.display());
        if output.json {
            write_json(out, &err)?;
        } else {
            write_lines(out, &[render_status_line(output.style, "fail", &message)])?;
        }
        return Ok(false);
    }

    manager.discard(identity)?;
    journal
        .release(identity)
        .with_context(|| format!("failed to clear run record for {identity}"))?;
    let message = format!("restored saved data for {identity} to owner {owner}");
    if output.json {
        write_json(out, &serde_json::json!({ "restored": identity, "owner": owner }))?;
    } else {
        write_lines(out, &[render_status_line(output.style, "ok", &message)])?;
    }
    Ok(true)
}

/// Profile to restore into. The profile recorded by the run wins; an explicit
/// one must agree with it, and is required when nothing was recorded.
pub fn restore_profile(
    identity: &PackageIdentity,
    requested: Option<UserProfileId>,
    recorded: Option<UserProfileId>,
) -> Result<UserProfileId> {
    match (requested, recorded) {
        (Some(requested), Some(recorded)) if requested != recorded => Err(anyhow!(
            "saved data for {identity} was taken from user profile {recorded}, not {requested}"
        )),
        (_, Some(recorded)) => Ok(recorded),
        (Some(requested), None) => Ok(requested),
        (None, None) => Err(anyhow!(
            "no user profile recorded for {identity}; pass --user <id>"
        )),
    }
}

pub fn discard_with_runner<R, W>(
    runner: &R,
    config: &PkgswapConfig,
    journal: &RunJournal,
    identity: &PackageIdentity,
    output: CliOutput,
    out: &mut W,
) -> Result<()>
where
    R: CommandRunner + ?Sized,
    W: Write,
{
    let layout = config.layout();
    DataSnapshotManager::new(runner, &layout).discard(identity)?;
    journal
        .release(identity)
        .with_context(|| format!("failed to clear run record for {identity}"))?;
    if output.json {
        return write_json(out, &serde_json::json!({ "discarded": identity }));
    }
    let message = format!("discarded saved data for {identity}");
    write_lines(out, &[render_status_line(output.style, "ok", &message)])
}

fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    writeln!(out, "{rendered}").context("failed to write output")
}

fn write_lines<W: Write>(out: &mut W, lines: &[String]) -> Result<()> {
    for line in lines {
        writeln!(out, "{line}").context("failed to write output")?;
    }
    Ok(())
}
