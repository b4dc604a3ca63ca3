use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use pkgswap_core::{OwnerId, PackageIdentity, ReplaceError, UserProfileId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::commands::quote_path;
use crate::{CommandOutput, CommandRunner, HostLayout};

/// Staged copy of a package's private data, consumed once by `restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSnapshot {
    pub identity: PackageIdentity,
    pub user: UserProfileId,
    pub staging_dir: PathBuf,
    pub has_external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub warnings: Vec<String>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct DataSnapshotManager<'a, R: ?Sized> {
    runner: &'a R,
    layout: &'a HostLayout,
    relabel: bool,
}

impl<'a, R> DataSnapshotManager<'a, R>
where
    R: CommandRunner + ?Sized,
{
    pub fn new(runner: &'a R, layout: &'a HostLayout) -> Self {
        Self {
            runner,
            layout,
            relabel: true,
        }
    }

    /// Controls whether `restorecon` runs after data is copied back.
    pub fn with_relabel(mut self, relabel: bool) -> Self {
        self.relabel = relabel;
        self
    }

    /// Copies the private data dir, and the external data dir when present,
    /// into the identity's staging dir. Stale staging content is removed
    /// first; a failed backup leaves no staging content behind.
    pub fn snapshot(
        &self,
        identity: &PackageIdentity,
        user: UserProfileId,
    ) -> Result<DataSnapshot, ReplaceError> {
        let staging_dir = self.layout.staging_dir(identity);
        let data_dir = self.layout.data_dir(identity, user);
        let external_dir = self.layout.external_data_dir(identity, user);

        let prepared = self.run(&[
            format!("rm -rf {}", quote_path(&staging_dir)),
            format!("mkdir -p {}", quote_path(&staging_dir)),
        ]);
        if !prepared.success {
            return Err(backup_failed(format!(
                "could not prepare staging dir {}: {}",
                staging_dir.display(),
                prepared.joined()
            )));
        }

        if !self.dir_exists(&data_dir) {
            self.discard_after_failed_backup(identity);
            return Err(backup_failed(format!(
                "private data dir not found: {}",
                data_dir.display()
            )));
        }

        let staged_data = self.layout.staged_data_dir(identity);
        let copied = self.run(&[copy_command(&data_dir, &staged_data)]);
        if !copied.success {
            self.discard_after_failed_backup(identity);
            return Err(backup_failed(format!(
                "could not copy {}: {}",
                data_dir.display(),
                copied.joined()
            )));
        }

        let has_external = self.dir_exists(&external_dir);
        if has_external {
            let staged_external = self.layout.staged_external_dir(identity);
            let copied = self.run(&[copy_command(&external_dir, &staged_external)]);
            if !copied.success {
                self.discard_after_failed_backup(identity);
                return Err(backup_failed(format!(
                    "could not copy {}: {}",
                    external_dir.display(),
                    copied.joined()
                )));
            }
        } else {
            debug!(%identity, dir = %external_dir.display(), "no external data dir to back up");
        }

        info!(%identity, staging = %staging_dir.display(), has_external, "private data staged");
        Ok(DataSnapshot {
            identity: identity.clone(),
            user,
            staging_dir,
            has_external,
        })
    }

    /// Replaces the package's data dirs with the staged copies and hands them
    /// to `owner`. Every failing sub-step becomes a warning; the staging dir
    /// is left for the caller to discard.
    pub fn restore(&self, snapshot: &DataSnapshot, owner: Option<OwnerId>) -> RestoreReport {
        let mut report = RestoreReport::default();
        let identity = &snapshot.identity;

        self.restore_dir(
            &self.layout.staged_data_dir(identity),
            &self.layout.data_dir(identity, snapshot.user),
            owner,
            &mut report,
        );
        if snapshot.has_external {
            self.restore_dir(
                &self.layout.staged_external_dir(identity),
                &self.layout.external_data_dir(identity, snapshot.user),
                owner,
                &mut report,
            );
        }

        if report.is_complete() {
            info!(%identity, "private data restored");
        } else {
            warn!(%identity, warnings = report.warnings.len(), "private data restore incomplete");
        }
        report
    }

    /// Snapshot left in the staging dir by an earlier run, if any.
    pub fn locate(&self, identity: &PackageIdentity, user: UserProfileId) -> Option<DataSnapshot> {
        if !self.dir_exists(&self.layout.staged_data_dir(identity)) {
            return None;
        }
        Some(DataSnapshot {
            identity: identity.clone(),
            user,
            staging_dir: self.layout.staging_dir(identity),
            has_external: self.dir_exists(&self.layout.staged_external_dir(identity)),
        })
    }

    /// Deletes the identity's staging dir.
    pub fn discard(&self, identity: &PackageIdentity) -> Result<()> {
        let staging_dir = self.layout.staging_dir(identity);
        let removed = self.run(&[format!("rm -rf {}", quote_path(&staging_dir))]);
        if !removed.success {
            return Err(anyhow!(
                "failed to remove staging dir {}: {}",
                staging_dir.display(),
                removed.joined()
            ));
        }
        debug!(%identity, staging = %staging_dir.display(), "staging dir removed");
        Ok(())
    }

    fn restore_dir(
        &self,
        staged: &Path,
        target: &Path,
        owner: Option<OwnerId>,
        report: &mut RestoreReport,
    ) {
        // The target is only replaced once the copy is complete.
        let incoming = incoming_dir(target);
        let copied = self.run(&[
            format!("rm -rf {}", quote_path(&incoming)),
            copy_command(staged, &incoming),
        ]);
        if !copied.success {
            let cleaned = self.run(&[format!("rm -rf {}", quote_path(&incoming))]);
            if !cleaned.success {
                warn!(dir = %incoming.display(), "partial restore copy left behind");
            }
            report.warnings.push(format!(
                "could not copy saved data back into {}: {}",
                target.display(),
                copied.joined()
            ));
            return;
        }

        let swapped = self.run(&[
            format!("rm -rf {}", quote_path(target)),
            format!("mv {} {}", quote_path(&incoming), quote_path(target)),
        ]);
        if !swapped.success {
            report.warnings.push(format!(
                "could not move saved data into {} (copy kept at {}): {}",
                target.display(),
                incoming.display(),
                swapped.joined()
            ));
            return;
        }

        match owner {
            Some(owner) => {
                let chowned =
                    self.run(&[format!("chown -R {owner}:{owner} {}", quote_path(target))]);
                if !chowned.success {
                    report.warnings.push(format!(
                        "could not hand {} to owner {owner}: {}",
                        target.display(),
                        chowned.joined()
                    ));
                }
            }
            None => report.warnings.push(format!(
                "owner id unknown, ownership of {} was not reapplied",
                target.display()
            )),
        }

        if self.relabel {
            let relabeled = self.run(&[format!("restorecon -R {}", quote_path(target))]);
            if !relabeled.success {
                report.warnings.push(format!(
                    "could not restore security labels on {}: {}",
                    target.display(),
                    relabeled.joined()
                ));
            }
        }
    }

    fn discard_after_failed_backup(&self, identity: &PackageIdentity) {
        if let Err(err) = self.discard(identity) {
            warn!(%identity, "{err:#}");
        }
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.run(&[format!("test -d {}", quote_path(path))]).success
    }

    fn run(&self, command_lines: &[String]) -> CommandOutput {
        match self.runner.execute(command_lines) {
            Ok(output) => output,
            Err(err) => CommandOutput {
                success: false,
                output_lines: vec![format!("{err:#}")],
            },
        }
    }
}

/// Sibling of `target` that a restore copies into before swapping it in.
fn incoming_dir(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".pkgswap-incoming");
    PathBuf::from(name)
}

fn copy_command(src: &Path, dst: &Path) -> String {
    format!("cp -a {} {}", quote_path(src), quote_path(dst))
}

fn backup_failed(reason: String) -> ReplaceError {
    ReplaceError::BackupFailed { reason }
}
