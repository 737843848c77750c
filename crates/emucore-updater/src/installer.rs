//! On-disk installation with a single backup generation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::feed::{sha256_hex, Artifact, Release};

const ARTIFACT_FILE: &str = "core.bin";
const RECEIPT_FILE: &str = "receipt.json";
const JOURNAL_FILE: &str = ".journal.json";

/// Written beside every installed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub identity: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
}

/// What is on disk for one core after an install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCore {
    pub version: String,
    pub backup_version: Option<String>,
}

/// What a finished install or revert replaced, so it can be put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum Journal {
    Install { displaced: bool, had_backup: bool },
    Revert { had_current: bool },
}

/// Performs the disk side of install and revert. Implementations must leave
/// the previous installation untouched when they return an error.
///
/// A successful install or revert stays undoable until `settle` or
/// `roll_back` is called for that core.
pub trait CoreInstaller: Send + Sync {
    /// Installs `artifact` as the current version. A version already installed
    /// becomes the backup, replacing any older backup.
    fn install(&self, release: &Release, artifact: &Artifact)
        -> Result<InstalledCore, UpdateError>;

    /// Restores the backup as the current version and discards what it replaced.
    fn revert(&self, identity: &str) -> Result<InstalledCore, UpdateError>;

    /// Drops what the last install or revert replaced.
    fn settle(&self, identity: &str) -> Result<(), UpdateError>;

    /// Puts back what the last unsettled install or revert replaced.
    fn roll_back(&self, identity: &str) -> Result<(), UpdateError>;

    fn installed(&self, identity: &str) -> Result<Option<InstalledCore>, UpdateError>;
}

/// Keeps each core in `<root>/<identity>/current` with at most one
/// `<root>/<identity>/backup`. Directory swaps are renames and are rolled
/// back if a later step fails.
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    root: PathBuf,
}

impl DirectoryInstaller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the installed artifact for `identity`, if the identity is valid.
    pub fn artifact_path(&self, identity: &str) -> Result<PathBuf, UpdateError> {
        Ok(self.core_dir(identity)?.join("current").join(ARTIFACT_FILE))
    }

    fn core_dir(&self, identity: &str) -> Result<PathBuf, UpdateError> {
        let valid = !identity.is_empty()
            && identity != "."
            && identity != ".."
            && !identity.contains(['/', '\\', ':'])
            && !identity.starts_with('.');
        if !valid {
            return Err(UpdateError::Disk(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("core identity {identity:?} cannot be used as a directory name"),
            )));
        }
        Ok(self.root.join(identity))
    }

    fn write_staging(
        &self,
        staging: &Path,
        release: &Release,
        artifact: &Artifact,
    ) -> Result<(), UpdateError> {
        remove_if_exists(staging)?;
        fs::create_dir_all(staging)?;
        fs::write(staging.join(ARTIFACT_FILE), &artifact.bytes)?;
        let receipt = InstallReceipt {
            identity: release.identity.clone(),
            version: release.version.clone(),
            installed_at: Utc::now(),
        };
        write_receipt(staging, &receipt)
    }
}

impl CoreInstaller for DirectoryInstaller {
    fn install(
        &self,
        release: &Release,
        artifact: &Artifact,
    ) -> Result<InstalledCore, UpdateError> {
        let core_dir = self.core_dir(&release.identity)?;
        verify(release, artifact)?;

        fs::create_dir_all(&core_dir)?;
        settle_dir(&core_dir)?;
        let current = core_dir.join("current");
        let backup = core_dir.join("backup");
        let staging = core_dir.join(".staging");
        let discard = core_dir.join(".discard");

        if let Err(err) = self.write_staging(&staging, release, artifact) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }

        let displaced = if current.exists() {
            Some(read_receipt(&current)?.version)
        } else {
            None
        };

        let mut had_backup = false;
        if displaced.is_some() {
            had_backup = backup.exists();
            if had_backup {
                fs::rename(&backup, &discard)?;
            }
            if let Err(err) = fs::rename(&current, &backup) {
                if had_backup {
                    let _ = fs::rename(&discard, &backup);
                }
                let _ = fs::remove_dir_all(&staging);
                return Err(err.into());
            }
            if let Err(err) = fs::rename(&staging, &current) {
                let _ = fs::rename(&backup, &current);
                if had_backup {
                    let _ = fs::rename(&discard, &backup);
                }
                let _ = fs::remove_dir_all(&staging);
                return Err(err.into());
            }
        } else if let Err(err) = fs::rename(&staging, &current) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err.into());
        }

        record(
            &core_dir,
            Journal::Install {
                displaced: displaced.is_some(),
                had_backup,
            },
        )?;

        tracing::debug!(
            identity = %release.identity,
            version = %release.version,
            displaced = ?displaced,
            "installed core artifact"
        );
        Ok(InstalledCore {
            version: release.version.clone(),
            backup_version: displaced,
        })
    }

    fn revert(&self, identity: &str) -> Result<InstalledCore, UpdateError> {
        let core_dir = self.core_dir(identity)?;
        let current = core_dir.join("current");
        let backup = core_dir.join("backup");
        let discard = core_dir.join(".discard");

        if !backup.exists() {
            return Err(UpdateError::NoBackupAvailable(identity.to_string()));
        }
        settle_dir(&core_dir)?;
        let restored = read_receipt(&backup)?;

        let had_current = current.exists();
        if had_current {
            fs::rename(&current, &discard)?;
        }
        if let Err(err) = fs::rename(&backup, &current) {
            if had_current {
                let _ = fs::rename(&discard, &current);
            }
            return Err(err.into());
        }
        record(&core_dir, Journal::Revert { had_current })?;

        tracing::debug!(identity, version = %restored.version, "restored core backup");
        Ok(InstalledCore {
            version: restored.version,
            backup_version: None,
        })
    }

    fn settle(&self, identity: &str) -> Result<(), UpdateError> {
        settle_dir(&self.core_dir(identity)?)?;
        Ok(())
    }

    fn roll_back(&self, identity: &str) -> Result<(), UpdateError> {
        let core_dir = self.core_dir(identity)?;
        let journal = match fs::read_to_string(core_dir.join(JOURNAL_FILE)) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                UpdateError::Disk(io::Error::new(io::ErrorKind::InvalidData, err))
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UpdateError::Disk(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no operation on {identity} to roll back"),
                )));
            }
            Err(err) => return Err(err.into()),
        };
        undo(&core_dir, journal)?;
        tracing::debug!(identity, ?journal, "rolled back core operation");
        Ok(())
    }

    fn installed(&self, identity: &str) -> Result<Option<InstalledCore>, UpdateError> {
        let core_dir = self.core_dir(identity)?;
        let current = core_dir.join("current");
        if !current.exists() {
            return Ok(None);
        }
        let version = read_receipt(&current)?.version;
        let backup = core_dir.join("backup");
        let backup_version = if backup.exists() {
            Some(read_receipt(&backup)?.version)
        } else {
            None
        };
        Ok(Some(InstalledCore {
            version,
            backup_version,
        }))
    }
}

fn verify(release: &Release, artifact: &Artifact) -> Result<(), UpdateError> {
    if artifact.bytes.is_empty() {
        return Err(UpdateError::Verification(format!(
            "artifact for {} {} is empty",
            release.identity, release.version
        )));
    }
    match &artifact.sha256 {
        Some(expected) => {
            let actual = sha256_hex(&artifact.bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(UpdateError::Verification(format!(
                    "checksum mismatch for {} {}: expected {}, got {}",
                    release.identity, release.version, expected, actual
                )));
            }
        }
        None => {
            tracing::warn!(
                identity = %release.identity,
                version = %release.version,
                "installing artifact without a checksum"
            );
        }
    }
    Ok(())
}

fn record(core_dir: &Path, journal: Journal) -> Result<(), UpdateError> {
    let written = serde_json::to_string(&journal)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
        .and_then(|json| fs::write(core_dir.join(JOURNAL_FILE), json));
    if let Err(err) = written {
        if let Err(undo_err) = undo(core_dir, journal) {
            tracing::error!(?undo_err, core = %core_dir.display(), "failed to undo core operation");
        }
        return Err(err.into());
    }
    Ok(())
}

fn undo(core_dir: &Path, journal: Journal) -> io::Result<()> {
    let current = core_dir.join("current");
    let backup = core_dir.join("backup");
    let staging = core_dir.join(".staging");
    let discard = core_dir.join(".discard");
    match journal {
        Journal::Install {
            displaced,
            had_backup,
        } => {
            remove_if_exists(&staging)?;
            fs::rename(&current, &staging)?;
            if displaced {
                fs::rename(&backup, &current)?;
            }
            if had_backup {
                fs::rename(&discard, &backup)?;
            }
            remove_if_exists(&staging)?;
        }
        Journal::Revert { had_current } => {
            fs::rename(&current, &backup)?;
            if had_current {
                fs::rename(&discard, &current)?;
            }
        }
    }
    remove_file_if_exists(&core_dir.join(JOURNAL_FILE))
}

fn settle_dir(core_dir: &Path) -> io::Result<()> {
    remove_if_exists(&core_dir.join(".discard"))?;
    remove_file_if_exists(&core_dir.join(JOURNAL_FILE))
}

fn read_receipt(dir: &Path) -> Result<InstallReceipt, UpdateError> {
    let raw = fs::read_to_string(dir.join(RECEIPT_FILE))?;
    serde_json::from_str(&raw)
        .map_err(|err| UpdateError::Disk(io::Error::new(io::ErrorKind::InvalidData, err)))
}

fn write_receipt(dir: &Path, receipt: &InstallReceipt) -> Result<(), UpdateError> {
    let json = serde_json::to_string_pretty(receipt)
        .map_err(|err| UpdateError::Disk(io::Error::new(io::ErrorKind::InvalidData, err)))?;
    fs::write(dir.join(RECEIPT_FILE), json)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn release(version: &str) -> Release {
        Release::new("org.emucores.mgba", version)
    }

    fn artifact(version: &str) -> Artifact {
        Artifact::new(format!("mgba-{version}").into_bytes())
    }

    #[test]
    fn first_install_has_no_backup() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        let installed = installer.install(&release("0.10"), &artifact("0.10")).unwrap();
        assert_eq!(
            installed,
            InstalledCore {
                version: "0.10".into(),
                backup_version: None
            }
        );
        let bytes = fs::read(installer.artifact_path("org.emucores.mgba").unwrap()).unwrap();
        assert_eq!(bytes, b"mgba-0.10".to_vec());
    }

    #[test]
    fn update_keeps_single_backup_generation() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        installer.install(&release("0.10"), &artifact("0.10")).unwrap();
        let installed = installer.install(&release("0.11"), &artifact("0.11")).unwrap();
        assert_eq!(installed.backup_version.as_deref(), Some("0.10"));
        assert_eq!(
            installer.installed("org.emucores.mgba").unwrap(),
            Some(InstalledCore {
                version: "0.11".into(),
                backup_version: Some("0.10".into())
            })
        );
        installer.settle("org.emucores.mgba").unwrap();
        assert!(!dir.path().join("org.emucores.mgba/.discard").exists());
    }

    #[test]
    fn roll_back_undoes_unsettled_update() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        installer.install(&release("0.10"), &artifact("0.10")).unwrap();
        installer.settle("org.emucores.mgba").unwrap();

        installer.install(&release("0.11"), &artifact("0.11")).unwrap();
        installer.roll_back("org.emucores.mgba").unwrap();
        assert_eq!(
            installer.installed("org.emucores.mgba").unwrap(),
            Some(InstalledCore {
                version: "0.10".into(),
                backup_version: Some("0.9".into())
            })
        );
        let bytes = fs::read(installer.artifact_path("org.emucores.mgba").unwrap()).unwrap();
        assert_eq!(bytes, b"mgba-0.10".to_vec());
        assert!(matches!(
            installer.roll_back("org.emucores.mgba"),
            Err(UpdateError::Disk(_))
        ));
    }

    #[test]
    fn roll_back_removes_first_install() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        installer.roll_back("org.emucores.mgba").unwrap();
        assert_eq!(installer.installed("org.emucores.mgba").unwrap(), None);
    }

    #[test]
    fn roll_back_undoes_revert() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        installer.install(&release("0.10"), &artifact("0.10")).unwrap();
        installer.revert("org.emucores.mgba").unwrap();
        installer.roll_back("org.emucores.mgba").unwrap();
        assert_eq!(
            installer.installed("org.emucores.mgba").unwrap(),
            Some(InstalledCore {
                version: "0.10".into(),
                backup_version: Some("0.9".into())
            })
        );
    }

    #[test]
    fn revert_restores_backup_and_consumes_it() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        installer.install(&release("0.10"), &artifact("0.10")).unwrap();
        let reverted = installer.revert("org.emucores.mgba").unwrap();
        assert_eq!(reverted.version, "0.9");
        assert_eq!(reverted.backup_version, None);
        let bytes = fs::read(installer.artifact_path("org.emucores.mgba").unwrap()).unwrap();
        assert_eq!(bytes, b"mgba-0.9".to_vec());
        assert!(matches!(
            installer.revert("org.emucores.mgba"),
            Err(UpdateError::NoBackupAvailable(_))
        ));
    }

    #[test]
    fn checksum_mismatch_leaves_install_untouched() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        installer.install(&release("0.9"), &artifact("0.9")).unwrap();
        let mut tampered = artifact("0.10");
        tampered.bytes.push(0);
        let err = installer.install(&release("0.10"), &tampered).unwrap_err();
        assert!(matches!(err, UpdateError::Verification(_)));
        assert_eq!(
            installer.installed("org.emucores.mgba").unwrap(),
            Some(InstalledCore {
                version: "0.9".into(),
                backup_version: None
            })
        );
    }

    #[test]
    fn unsafe_identities_are_rejected() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        for identity in ["", "..", "../escape", "a/b", ".hidden"] {
            let err = installer
                .install(&Release::new(identity, "1.0"), &artifact("1.0"))
                .unwrap_err();
            assert!(matches!(err, UpdateError::Disk(_)), "{identity:?}");
        }
    }

    #[test]
    fn unverified_artifacts_install() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path());
        let installed = installer
            .install(&release("1.0"), &Artifact::unverified(b"raw".to_vec()))
            .unwrap();
        assert_eq!(installed.version, "1.0");
        assert_eq!(installer.installed("unknown").unwrap(), None);
    }
}
