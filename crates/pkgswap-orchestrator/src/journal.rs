use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use pkgswap_core::{OwnerId, PackageIdentity, RecoveryOutcome, UserProfileId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ProgressEvent, ProgressObserver};

/// Marker for a run that is in flight, or that stopped while holding a
/// data snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub identity: PackageIdentity,
    pub archive: String,
    pub pid: u32,
    pub started_at_unix: u64,
    #[serde(default)]
    pub last_step: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Profile whose data dirs the snapshot was taken from.
    #[serde(default)]
    pub user: Option<UserProfileId>,
    /// Owner of the data before the package was uninstalled.
    #[serde(default)]
    pub previous_owner: Option<OwnerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub event: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub at_unix: u64,
}

/// Local record of replacement runs, one marker and one journal per identity.
#[derive(Debug, Clone)]
pub struct RunJournal {
    state_dir: PathBuf,
}

impl RunJournal {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn marker_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.runs_dir().join(format!("{identity}.active"))
    }

    pub fn journal_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.runs_dir().join(format!("{identity}.journal"))
    }

    /// Claims the identity for one run. Fails when another run, live or
    /// dangling, already holds it.
    pub fn claim(&self, identity: &PackageIdentity, archive: &Path) -> Result<ActiveRun> {
        let dir = self.runs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let path = self.marker_path(identity);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let detail = self
                    .read_marker(&path)
                    .ok()
                    .map(|run| {
                        format!(
                            " (pid={}, last_step={})",
                            run.pid,
                            run.last_step.unwrap_or_default()
                        )
                    })
                    .unwrap_or_default();
                return Err(anyhow!(
                    "a replacement run for {identity} is already recorded{detail}; see `pkgswap status`"
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to claim run marker: {}", path.display()));
            }
        };

        let run = ActiveRun {
            identity: identity.clone(),
            archive: archive.display().to_string(),
            pid: std::process::id(),
            started_at_unix: now_unix(),
            last_step: None,
            snapshot: None,
            user: None,
            previous_owner: None,
        };
        file.write_all(serde_json::to_string_pretty(&run)?.as_bytes())
            .with_context(|| format!("failed to write run marker: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush run marker: {}", path.display()))?;

        let journal = self.journal_path(identity);
        if journal.exists() {
            fs::remove_file(&journal)
                .with_context(|| format!("failed to reset run journal: {}", journal.display()))?;
        }
        Ok(run)
    }

    pub fn append(&self, identity: &PackageIdentity, entry: &JournalEntry) -> Result<()> {
        let path = self.journal_path(identity);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open run journal: {}", path.display()))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append run journal: {}", path.display()))?;
        Ok(())
    }

    pub fn read_entries(&self, identity: &PackageIdentity) -> Result<Vec<JournalEntry>> {
        let path = self.journal_path(identity);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read run journal: {}", path.display()));
            }
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("failed parsing run journal: {}", path.display()))
            })
            .collect()
    }

    /// Marker recorded for `identity`, if any.
    pub fn active(&self, identity: &PackageIdentity) -> Result<Option<ActiveRun>> {
        let path = self.marker_path(identity);
        if !path.exists() {
            return Ok(None);
        }
        self.read_marker(&path).map(Some)
    }

    /// Updates the marker with the latest step and snapshot location.
    pub fn update(
        &self,
        identity: &PackageIdentity,
        apply: impl FnOnce(&mut ActiveRun),
    ) -> Result<()> {
        let path = self.marker_path(identity);
        let mut run = self.read_marker(&path)?;
        apply(&mut run);
        fs::write(&path, serde_json::to_string_pretty(&run)?)
            .with_context(|| format!("failed to write run marker: {}", path.display()))
    }

    /// Closes a run. A run that left a snapshot behind keeps its marker so
    /// the snapshot can be found later.
    pub fn finish(&self, identity: &PackageIdentity, outcome: &RecoveryOutcome) -> Result<()> {
        if let RecoveryOutcome::FailedAtStep { world, .. } = outcome {
            if let Some(snapshot) = &world.snapshot {
                let snapshot = snapshot.clone();
                return self.update(identity, |run| run.snapshot = Some(snapshot));
            }
        }
        self.release(identity)
    }

    pub fn release(&self, identity: &PackageIdentity) -> Result<()> {
        for path in [self.marker_path(identity), self.journal_path(identity)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    pub fn list_active(&self) -> Result<Vec<ActiveRun>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("active") {
                continue;
            }
            runs.push(self.read_marker(&path)?);
        }
        runs.sort_by(|left, right| left.identity.cmp(&right.identity));
        Ok(runs)
    }

    fn read_marker(&self, path: &Path) -> Result<ActiveRun> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read run marker: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing run marker: {}", path.display()))
    }
}

/// Writes every progress event to the run journal before passing it on.
pub struct JournalObserver<'j, O> {
    journal: &'j RunJournal,
    identity: PackageIdentity,
    seq: u64,
    inner: O,
}

impl<'j, O> JournalObserver<'j, O>
where
    O: ProgressObserver,
{
    pub fn new(journal: &'j RunJournal, identity: PackageIdentity, inner: O) -> Self {
        Self {
            journal,
            identity,
            seq: 0,
            inner,
        }
    }

    pub fn into_inner(self) -> O {
        self.inner
    }

    fn record(&mut self, event: &ProgressEvent) -> Result<()> {
        let (name, detail) = match event {
            ProgressEvent::Entered(step) => (step.as_str().to_string(), None),
            ProgressEvent::IdentityResolved(identity) => {
                ("identity".to_string(), Some(identity.to_string()))
            }
            ProgressEvent::FactsResolved(facts) => {
                ("facts".to_string(), Some(serde_json::to_string(facts)?))
            }
            ProgressEvent::ConfirmationRequested { .. } => ("confirmation".to_string(), None),
            ProgressEvent::SnapshotStaged(path) => ("snapshot".to_string(), Some(path.clone())),
            ProgressEvent::Warning(message) => ("warning".to_string(), Some(message.clone())),
        };

        self.seq += 1;
        self.journal.append(
            &self.identity,
            &JournalEntry {
                seq: self.seq,
                event: name,
                detail,
                at_unix: now_unix(),
            },
        )?;

        match event {
            ProgressEvent::Entered(step) => {
                let step = step.as_str().to_string();
                self.journal
                    .update(&self.identity, |run| run.last_step = Some(step))
            }
            ProgressEvent::FactsResolved(facts) => {
                let (user, owner) = (facts.user_profile_id, facts.owner_id);
                self.journal.update(&self.identity, |run| {
                    run.user = Some(user);
                    run.previous_owner = owner;
                })
            }
            ProgressEvent::SnapshotStaged(path) => {
                let path = path.clone();
                self.journal
                    .update(&self.identity, |run| run.snapshot = Some(path))
            }
            _ => Ok(()),
        }
    }
}

impl<O> ProgressObserver for JournalObserver<'_, O>
where
    O: ProgressObserver,
{
    fn observe(&mut self, event: ProgressEvent) {
        if let Err(err) = self.record(&event) {
            warn!(identity = %self.identity, "failed to journal progress: {err:#}");
        }
        self.inner.observe(event);
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
