use std::collections::HashMap;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use emucore_registry::ComponentDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::UpdateError;

/// A core advertised by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCore {
    pub identity: String,
    pub display_name: String,
    pub systems: Vec<String>,
}

impl FeedCore {
    pub fn new(
        identity: impl Into<String>,
        display_name: impl Into<String>,
        systems: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            systems: systems.into_iter().map(Into::into).collect(),
        }
    }

    pub fn into_descriptor(self) -> ComponentDescriptor {
        ComponentDescriptor::new(self.identity, self.display_name, self.systems)
    }
}

/// The newest version the feed offers for one core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub identity: String,
    pub version: String,
    pub published: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(identity: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            version: version.into(),
            published: None,
        }
    }

    pub fn published_at(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }
}

/// Downloaded payload of a release. `sha256` is the digest the feed vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub sha256: Option<String>,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        Self {
            bytes,
            sha256: Some(sha256),
        }
    }

    pub fn unverified(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            sha256: None,
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Forwards download progress for one core back to the updater.
pub struct ProgressReporter {
    sink: Box<dyn Fn(f32) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, fraction: f32) {
        if fraction.is_finite() {
            (self.sink)(fraction.clamp(0.0, 1.0));
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Source of core metadata and artifacts. Calls may block; the updater only
/// invokes them from worker threads and bounds them with its network timeout.
pub trait CoreFeed: Send + Sync {
    /// Every core the feed knows about.
    fn discover(&self) -> Result<Vec<FeedCore>, UpdateError>;

    /// Latest releases for the given identities. Unknown identities are omitted.
    fn releases(&self, identities: &[String]) -> Result<Vec<Release>, UpdateError>;

    fn fetch(&self, release: &Release, progress: &ProgressReporter)
        -> Result<Artifact, UpdateError>;
}

/// Blocks fetches of one core until released or dropped.
#[derive(Debug)]
pub struct FetchGate {
    _release: Sender<()>,
}

impl FetchGate {
    pub fn release(self) {}
}

#[derive(Debug, Default)]
struct StaticFeedData {
    cores: Vec<FeedCore>,
    releases: HashMap<String, Release>,
    artifacts: HashMap<(String, String), Artifact>,
    failures: HashMap<String, String>,
    offline: Option<String>,
    gates: HashMap<String, Receiver<()>>,
}

/// In-memory feed for embedding a fixed catalog and for exercising the updater.
#[derive(Debug, Default)]
pub struct StaticFeed {
    data: Mutex<StaticFeedData>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_core(&self, core: FeedCore) {
        let mut data = self.data.lock();
        data.cores.retain(|existing| existing.identity != core.identity);
        data.cores.push(core);
    }

    /// Makes `release` the latest version and serves `bytes` for it.
    pub fn publish(&self, release: Release, bytes: impl Into<Vec<u8>>) {
        self.publish_artifact(release, Artifact::new(bytes.into()));
    }

    pub fn publish_artifact(&self, release: Release, artifact: Artifact) {
        let mut data = self.data.lock();
        data.artifacts.insert(
            (release.identity.clone(), release.version.clone()),
            artifact,
        );
        data.releases.insert(release.identity.clone(), release);
    }

    /// Fails every fetch for `identity` with a network error until cleared.
    pub fn fail_fetches(&self, identity: &str, reason: impl Into<String>) {
        self.data
            .lock()
            .failures
            .insert(identity.to_string(), reason.into());
    }

    pub fn clear_failures(&self) {
        self.data.lock().failures.clear();
    }

    /// Fails every call with a network error until `None` is set again.
    pub fn set_offline(&self, reason: Option<String>) {
        self.data.lock().offline = reason;
    }

    pub fn hold_fetches(&self, identity: &str) -> FetchGate {
        let (tx, rx) = bounded(0);
        self.data.lock().gates.insert(identity.to_string(), rx);
        FetchGate { _release: tx }
    }

    fn check_online(&self) -> Result<(), UpdateError> {
        match &self.data.lock().offline {
            Some(reason) => Err(UpdateError::Network(reason.clone())),
            None => Ok(()),
        }
    }
}

impl CoreFeed for StaticFeed {
    fn discover(&self) -> Result<Vec<FeedCore>, UpdateError> {
        self.check_online()?;
        Ok(self.data.lock().cores.clone())
    }

    fn releases(&self, identities: &[String]) -> Result<Vec<Release>, UpdateError> {
        self.check_online()?;
        let data = self.data.lock();
        Ok(identities
            .iter()
            .filter_map(|identity| data.releases.get(identity).cloned())
            .collect())
    }

    fn fetch(
        &self,
        release: &Release,
        progress: &ProgressReporter,
    ) -> Result<Artifact, UpdateError> {
        self.check_online()?;
        progress.report(0.0);
        let gate = self.data.lock().gates.remove(&release.identity);
        if let Some(gate) = gate {
            // Returns once the gate's sender is released.
            let _ = gate.recv();
        }
        if let Some(reason) = self.data.lock().failures.get(&release.identity) {
            return Err(UpdateError::Network(reason.clone()));
        }
        progress.report(0.5);
        let artifact = self
            .data
            .lock()
            .artifacts
            .get(&(release.identity.clone(), release.version.clone()))
            .cloned()
            .ok_or_else(|| {
                UpdateError::Network(format!(
                    "no artifact for {} {}",
                    release.identity, release.version
                ))
            })?;
        progress.report(1.0);
        Ok(artifact)
    }
}
