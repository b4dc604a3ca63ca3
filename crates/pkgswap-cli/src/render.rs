use std::io::{BufRead, IsTerminal, Write};
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use pkgswap_core::{InstalledPackageFacts, PackageIdentity, RecoveryOutcome, Step};
use pkgswap_orchestrator::{
    ActiveRun, ConfirmationHandle, Decision, ProgressEvent, ProgressObserver,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

impl OutputStyle {
    pub fn detect(json: bool) -> Self {
        if !json && std::io::stdout().is_terminal() {
            Self::Rich
        } else {
            Self::Plain
        }
    }
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "fail" => "[FAIL]",
        _ => "[..]",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub fn step_label(step: Step) -> &'static str {
    match step {
        Step::Installing => "installing package",
        Step::ClassifyingFailure => "reading install failure",
        Step::ResolvingIdentity => "reading archive identity",
        Step::ResolvingFacts => "inspecting installed package",
        Step::AwaitingConfirmation => "waiting for confirmation",
        Step::BackingUp => "backing up data",
        Step::Uninstalling => "removing old package",
        Step::Reinstalling => "installing new package",
        Step::ResolvingNewOwner => "resolving new owner",
        Step::Restoring => "restoring data",
    }
}

pub fn format_facts_lines(
    identity: &PackageIdentity,
    facts: &InstalledPackageFacts,
) -> Vec<String> {
    let mut lines = vec![format!("package: {identity}")];
    match facts.install_paths.as_slice() {
        [] => lines.push("install path: unknown".to_string()),
        [path] => lines.push(format!("install path: {path}")),
        paths => {
            lines.push(format!("install paths: {} split artifacts", paths.len()));
            lines.extend(paths.iter().map(|path| format!("  {path}")));
        }
    }
    lines.push(format!("location: {}", facts.location_class.as_str()));
    let detected = if facts.user_profile_detected {
        ""
    } else {
        " (assumed)"
    };
    lines.push(format!("user profile: {}{detected}", facts.user_profile_id));
    lines.push(match facts.owner_id {
        Some(owner) => format!("owner id: {owner}"),
        None => "owner id: unknown".to_string(),
    });
    lines
}

pub fn format_outcome_lines(style: OutputStyle, outcome: &RecoveryOutcome) -> Vec<String> {
    match outcome {
        RecoveryOutcome::InstalledCleanly => {
            vec![render_status_line(style, "ok", "installed")]
        }
        RecoveryOutcome::InstalledWithDataRestored { identity } => vec![render_status_line(
            style,
            "ok",
            &format!("replaced {identity}, data restored"),
        )],
        RecoveryOutcome::InstalledWithDataRestoreWarning { identity, warnings } => {
            let count = warnings.len();
            let noun = if count == 1 { "warning" } else { "warnings" };
            vec![render_status_line(
                style,
                "warn",
                &format!("replaced {identity}, data restored with {count} {noun}"),
            )]
        }
        RecoveryOutcome::FailedAtStep { step, error, world } => vec![
            render_status_line(
                style,
                "fail",
                &format!("failed while {}: {error}", step_label(*step)),
            ),
            format!("  {}", world.describe()),
        ],
    }
}

pub fn format_run_lines(runs: &[ActiveRun]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no recorded runs".to_string()];
    }
    runs.iter()
        .map(|run| {
            let mut line = format!(
                "{} pid={} last_step={}",
                run.identity,
                run.pid,
                run.last_step.as_deref().unwrap_or("none")
            );
            if let Some(user) = run.user {
                line.push_str(&format!(" user={user}"));
            }
            if let Some(snapshot) = &run.snapshot {
                line.push_str(&format!(" snapshot={snapshot}"));
            }
            line.push_str(&format!(" archive={}", run.archive));
            line
        })
        .collect()
}

/// Asks on `output` whether to replace the package and reads the answer from
/// `input`. Anything but an explicit yes denies.
pub fn prompt_confirmation<I, W>(
    input: &mut I,
    output: &mut W,
    identity: &PackageIdentity,
    facts: &InstalledPackageFacts,
) -> Result<Decision>
where
    I: BufRead,
    W: Write,
{
    writeln!(
        output,
        "{identity} is installed with a different signature and must be uninstalled."
    )?;
    for line in format_facts_lines(identity, facts) {
        writeln!(output, "  {line}")?;
    }
    write!(output, "Back up its data and replace it? [y/N] ")?;
    output.flush().context("failed to flush confirmation prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation answer")?;
    Ok(match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Approve,
        _ => Decision::Deny,
    })
}

/// Terminal observer for one run: a spinner while states advance, warnings
/// as status lines, and the interactive confirmation prompt.
pub struct TerminalObserver {
    style: OutputStyle,
    spinner: Option<ProgressBar>,
    started_at: Instant,
    confirmation: Option<ConfirmationHandle>,
}

impl TerminalObserver {
    pub fn new(style: OutputStyle, confirmation: Option<ConfirmationHandle>) -> Self {
        let spinner = (style == OutputStyle::Rich).then(|| {
            let spinner = ProgressBar::new_spinner();
            let template = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}");
            if let Ok(template) = template {
                spinner.set_style(template.tick_chars(".oO@* "));
            }
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        });
        Self {
            style,
            spinner,
            started_at: Instant::now(),
            confirmation,
        }
    }

    pub fn finish(mut self) -> Duration {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        self.started_at.elapsed()
    }

    pub fn elapsed_label(elapsed: Duration) -> String {
        format!("complete in {}", format_elapsed(elapsed))
    }

    fn print_err(&self, line: &str) {
        match &self.spinner {
            Some(spinner) => spinner.suspend(|| eprintln!("{line}")),
            None => eprintln!("{line}"),
        }
    }

    fn confirm(&mut self, identity: &PackageIdentity, facts: &InstalledPackageFacts) {
        let Some(handle) = self.confirmation.take() else {
            return;
        };
        let ask = || {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stderr();
            prompt_confirmation(&mut input, &mut output, identity, facts)
        };
        let answer = match &self.spinner {
            Some(spinner) => spinner.suspend(ask),
            None => ask(),
        };
        match answer {
            Ok(decision) => handle.fulfill(decision),
            Err(err) => {
                tracing::warn!("confirmation prompt failed: {err:#}");
                handle.fulfill(Decision::Deny);
            }
        }
    }
}

impl ProgressObserver for TerminalObserver {
    fn observe(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Entered(step) => {
                if let Some(spinner) = &self.spinner {
                    spinner.set_message(step_label(step));
                }
            }
            ProgressEvent::IdentityResolved(identity) => {
                tracing::info!(%identity, "archive identity resolved");
            }
            ProgressEvent::FactsResolved(_) => {}
            ProgressEvent::ConfirmationRequested { identity, facts } => {
                self.confirm(&identity, &facts);
            }
            ProgressEvent::SnapshotStaged(path) => {
                self.print_err(&render_status_line(
                    self.style,
                    "ok",
                    &format!("data saved to {path}"),
                ));
            }
            ProgressEvent::Warning(message) => {
                self.print_err(&render_status_line(self.style, "warn", &message));
            }
        }
    }
}
