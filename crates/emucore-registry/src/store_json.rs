use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{ComponentDescriptor, DownloadState};
use crate::notify::{ChangeHub, Subscription};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access core registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse core registry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("core {0} is already registered")]
    Duplicate(String),
    #[error("unknown core {0}")]
    UnknownIdentity(String),
    #[error("update attempted to change the identity of core {0}")]
    IdentityChanged(String),
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct JsonStoreData {
    cores: Vec<ComponentDescriptor>,
}

/// How a mutation reaches the registry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    /// Not applied unless the file is written.
    Persist,
    /// Applied even if the file cannot be written.
    BestEffort,
    /// Only touches fields the file does not hold.
    Memory,
}

/// Ordered, observable set of core descriptors.
///
/// Reads are served from any thread. Mutations are serialized: each one is
/// persisted, swapped in, and announced to subscribers before the next is
/// accepted. A mutation that leaves the data unchanged is not announced.
#[derive(Debug)]
pub struct RegistryStore {
    path: Option<PathBuf>,
    data: RwLock<JsonStoreData>,
    revision: AtomicU64,
    writer: Mutex<()>,
    hub: Arc<ChangeHub>,
}

impl RegistryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut data: JsonStoreData = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            JsonStoreData::default()
        };
        settle_loaded(&mut data.cores);
        Ok(Self::with_data(Some(path), data))
    }

    pub fn in_memory() -> Self {
        Self::with_data(None, JsonStoreData::default())
    }

    fn with_data(path: Option<PathBuf>, mut data: JsonStoreData) -> Self {
        sort_cores(&mut data.cores);
        Self {
            path,
            data: RwLock::new(data),
            revision: AtomicU64::new(0),
            writer: Mutex::new(()),
            hub: ChangeHub::new(),
        }
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let mut config_dir = dirs::config_dir().ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no config directory",
            ))
        })?;
        config_dir.push("EmuCores");
        fs::create_dir_all(&config_dir)?;
        config_dir.push("cores.json");
        Ok(config_dir)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Vec<ComponentDescriptor> {
        self.data.read().cores.clone()
    }

    pub fn find(&self, identity: &str) -> Option<ComponentDescriptor> {
        self.data
            .read()
            .cores
            .iter()
            .find(|core| core.identity == identity)
            .cloned()
    }

    pub fn has_backup(&self, identity: &str) -> bool {
        self.data
            .read()
            .cores
            .iter()
            .any(|core| core.identity == identity && core.has_backup())
    }

    pub fn identities(&self) -> Vec<String> {
        self.data
            .read()
            .cores
            .iter()
            .map(|core| core.identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().cores.is_empty()
    }

    /// Number of committed mutations since the store was opened.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn insert(&self, core: ComponentDescriptor) -> Result<(), StoreError> {
        self.commit(|cores| {
            if cores.iter().any(|existing| existing.identity == core.identity) {
                return Err(StoreError::Duplicate(core.identity));
            }
            cores.push(core);
            Ok(())
        })
    }

    /// Adds cores whose identity is not yet known and returns how many were added.
    pub fn merge_discovered(
        &self,
        discovered: Vec<ComponentDescriptor>,
    ) -> Result<usize, StoreError> {
        self.commit(|cores| {
            let mut known: HashSet<String> =
                cores.iter().map(|core| core.identity.clone()).collect();
            let mut added = 0;
            for core in discovered {
                if known.insert(core.identity.clone()) {
                    log::debug!("registering core {}", core.identity);
                    cores.push(core);
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    pub fn update<F>(&self, identity: &str, mutate: F) -> Result<ComponentDescriptor, StoreError>
    where
        F: FnOnce(&mut ComponentDescriptor),
    {
        self.commit_with(Durability::Persist, |cores| update_one(cores, identity, mutate))
    }

    /// Updates fields that are never written to the registry file, such as
    /// download progress. The file is left alone.
    pub fn update_transient<F>(
        &self,
        identity: &str,
        mutate: F,
    ) -> Result<ComponentDescriptor, StoreError>
    where
        F: FnOnce(&mut ComponentDescriptor),
    {
        self.commit_with(Durability::Memory, |cores| update_one(cores, identity, mutate))
    }

    /// Puts `core` back in place of the entry with the same identity. The
    /// restore is applied and announced even when the file cannot be written;
    /// the next successful mutation rewrites it.
    pub fn restore(&self, core: ComponentDescriptor) -> Result<(), StoreError> {
        let identity = core.identity.clone();
        self.commit_with(Durability::BestEffort, |cores| {
            update_one(cores, &identity, move |existing| *existing = core)
        })
        .map(|_| ())
    }

    /// Applies `mutate` to every core as a single mutation.
    pub fn update_all<F>(&self, mut mutate: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut ComponentDescriptor),
    {
        self.commit(|cores| {
            for core in cores.iter_mut() {
                let identity = core.identity.clone();
                mutate(core);
                if core.identity != identity {
                    return Err(StoreError::IdentityChanged(identity));
                }
            }
            Ok(())
        })
    }

    pub fn remove(&self, identity: &str) -> Result<ComponentDescriptor, StoreError> {
        self.commit(|cores| {
            let index = cores
                .iter()
                .position(|core| core.identity == identity)
                .ok_or_else(|| StoreError::UnknownIdentity(identity.to_string()))?;
            Ok(cores.remove(index))
        })
    }

    fn commit<R, F>(&self, mutate: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<ComponentDescriptor>) -> Result<R, StoreError>,
    {
        self.commit_with(Durability::Persist, mutate)
    }

    fn commit_with<R, F>(&self, durability: Durability, mutate: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<ComponentDescriptor>) -> Result<R, StoreError>,
    {
        let _writer = self.writer.lock();
        let current = self.data.read().clone();
        let mut next = current.clone();
        let result = mutate(&mut next.cores)?;
        sort_cores(&mut next.cores);
        if next == current {
            return Ok(result);
        }
        match durability {
            Durability::Persist => self.persist(&next)?,
            Durability::BestEffort => {
                if let Err(err) = self.persist(&next) {
                    log::warn!("core registry kept in memory only: {err}");
                }
            }
            Durability::Memory => {}
        }
        *self.data.write() = next;
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.hub.publish();
        Ok(result)
    }

    fn persist(&self, data: &JsonStoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}

fn update_one<F>(
    cores: &mut [ComponentDescriptor],
    identity: &str,
    mutate: F,
) -> Result<ComponentDescriptor, StoreError>
where
    F: FnOnce(&mut ComponentDescriptor),
{
    let core = cores
        .iter_mut()
        .find(|core| core.identity == identity)
        .ok_or_else(|| StoreError::UnknownIdentity(identity.to_string()))?;
    mutate(core);
    if core.identity != identity {
        return Err(StoreError::IdentityChanged(identity.to_string()));
    }
    Ok(core.clone())
}

fn sort_cores(cores: &mut [ComponentDescriptor]) {
    cores.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.identity.cmp(&b.identity))
    });
}

fn settle_loaded(cores: &mut Vec<ComponentDescriptor>) {
    let mut seen = HashSet::new();
    cores.retain(|core| {
        let fresh = seen.insert(core.identity.clone());
        if !fresh {
            log::warn!("ignoring duplicate core {} in registry file", core.identity);
        }
        fresh
    });
    for core in cores.iter_mut() {
        if core.state == DownloadState::Downloading {
            log::warn!(
                "core {} was mid-download when the registry was saved",
                core.identity
            );
            core.state = DownloadState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::notify::RegistryChanged;

    fn core(identity: &str, name: &str) -> ComponentDescriptor {
        ComponentDescriptor::new(identity, name, vec!["Game Boy".into()])
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = RegistryStore::in_memory();
        store.insert(core("a", "A")).unwrap();
        let err = store.insert(core("a", "Other")).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "a"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn merge_is_idempotent_and_sorted() {
        let store = RegistryStore::in_memory();
        let added = store
            .merge_discovered(vec![core("z", "zeta"), core("a", "Alpha"), core("m", "Mu")])
            .unwrap();
        assert_eq!(added, 3);
        let revision = store.revision();
        let added = store
            .merge_discovered(vec![core("a", "Alpha"), core("m", "Mu")])
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(store.revision(), revision);
        let names: Vec<_> = store
            .snapshot()
            .into_iter()
            .map(|core| core.display_name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Mu", "zeta"]);
    }

    #[test]
    fn every_mutation_publishes_exactly_once() {
        let store = RegistryStore::in_memory();
        let subscription = store.subscribe();
        store.insert(core("a", "A")).unwrap();
        store
            .update("a", |core| core.state = DownloadState::Downloading)
            .unwrap();
        store.update("a", |_| {}).unwrap();
        store.remove("a").unwrap();
        assert_eq!(subscription.drain(), 3);
        assert_eq!(store.revision(), 3);
    }

    #[test]
    fn snapshot_is_stable_without_mutation() {
        let store = RegistryStore::in_memory();
        store
            .merge_discovered(vec![core("b", "Beta"), core("a", "Alpha")])
            .unwrap();
        let subscription = store.subscribe();
        let first = store.snapshot();
        let second = store.snapshot();
        assert_eq!(first, second);
        assert_eq!(subscription.try_recv(), None);
        store.insert(core("c", "Gamma")).unwrap();
        assert_eq!(subscription.try_recv(), Some(RegistryChanged));
        assert_eq!(&store.snapshot()[..2], &first[..]);
    }

    #[test]
    fn update_unknown_and_identity_change_are_rejected() {
        let store = RegistryStore::in_memory();
        store.insert(core("a", "A")).unwrap();
        assert!(matches!(
            store.update("missing", |_| {}),
            Err(StoreError::UnknownIdentity(_))
        ));
        assert!(matches!(
            store.update("a", |core| core.identity = "b".into()),
            Err(StoreError::IdentityChanged(_))
        ));
        assert_eq!(store.find("a").unwrap().identity, "a");
        assert_eq!(store.find("b"), None);
    }

    #[test]
    fn persisted_store_reopens_with_interrupted_downloads_idle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cores.json");
        {
            let store = RegistryStore::open(&path).unwrap();
            store
                .insert(core("a", "A").with_installed("1.0", Some("0.9".into())))
                .unwrap();
            store.insert(core("b", "B")).unwrap();
            store
                .update("b", |core| {
                    core.state = DownloadState::Downloading;
                    core.progress = Some(0.3);
                })
                .unwrap();
        }
        let store = RegistryStore::open(&path).unwrap();
        let a = store.find("a").unwrap();
        assert_eq!(a.current_version.as_deref(), Some("1.0"));
        assert!(store.has_backup("a"));
        let b = store.find("b").unwrap();
        assert_eq!(b.state, DownloadState::Idle);
        assert_eq!(b.progress, None);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn failed_persist_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("cores.json");
        let store = RegistryStore::open(&path).unwrap();
        let subscription = store.subscribe();
        assert!(matches!(store.insert(core("a", "A")), Err(StoreError::Io(_))));
        assert!(store.is_empty());
        assert_eq!(store.revision(), 0);
        assert_eq!(subscription.try_recv(), None);
    }

    #[test]
    fn restore_and_progress_survive_unwritable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cores.json");
        let store = RegistryStore::open(&path).unwrap();
        store.insert(core("a", "A")).unwrap();
        let before = store.find("a").unwrap();
        store
            .update("a", |core| core.state = DownloadState::Downloading)
            .unwrap();

        // The staging file cannot be created while a directory holds its name.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let subscription = store.subscribe();
        let revision = store.revision();

        assert!(matches!(
            store.update("a", |core| core.state = DownloadState::Installed),
            Err(StoreError::Io(_))
        ));
        assert_eq!(store.find("a").unwrap().state, DownloadState::Downloading);

        store
            .update_transient("a", |core| core.progress = Some(0.5))
            .unwrap();
        assert_eq!(store.find("a").unwrap().progress, Some(0.5));

        store.restore(before.clone()).unwrap();
        assert_eq!(store.find("a").unwrap(), before);
        assert_eq!(store.revision(), revision + 2);
        assert_eq!(subscription.drain(), 2);
        assert!(matches!(
            store.restore(core("missing", "M")),
            Err(StoreError::UnknownIdentity(_))
        ));
    }
}
