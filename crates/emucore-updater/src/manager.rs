use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use emucore_registry::{ComponentDescriptor, DownloadState, RegistryStore, Subscription};

use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::feed::{CoreFeed, FeedCore, ProgressReporter, Release};
use crate::installer::{CoreInstaller, DirectoryInstaller, InstalledCore};
use crate::pending::{Pending, Responder};

enum Command {
    CheckForNewCores {
        responder: Responder<usize>,
    },
    CheckForUpdates {
        responder: Responder<usize>,
    },
    InstallOrUpdate {
        identity: String,
        responder: Responder<()>,
    },
    Revert {
        identity: String,
        responder: Responder<()>,
    },
    Progress {
        identity: String,
        generation: u64,
        fraction: f32,
    },
    Discovered {
        result: Result<Vec<ComponentDescriptor>, UpdateError>,
        responder: Responder<usize>,
    },
    ReleasesFetched {
        result: Result<Vec<Release>, UpdateError>,
        responder: Responder<usize>,
    },
    Finished {
        identity: String,
        generation: u64,
        result: Result<InstalledCore, UpdateError>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Install,
    Revert,
}

struct InFlight {
    previous: ComponentDescriptor,
    operation: Operation,
    generation: u64,
    responder: Responder<()>,
}

#[derive(Debug)]
struct Shared {
    store: Arc<RegistryStore>,
    commands: Sender<Command>,
    owner: Option<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.owner.take() {
            if let Err(err) = handle.join() {
                tracing::error!(?err, "failed to join core updater thread");
            }
        }
    }
}

/// Handle to the core lifecycle manager. Clones share one owner thread, which
/// stops when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct CoreUpdater {
    shared: Arc<Shared>,
}

impl CoreUpdater {
    pub fn spawn(
        store: Arc<RegistryStore>,
        feed: Arc<dyn CoreFeed>,
        installer: Arc<dyn CoreInstaller>,
        config: &UpdaterConfig,
    ) -> Result<Self, UpdateError> {
        let (tx, rx) = unbounded();
        let owner = Owner {
            store: Arc::clone(&store),
            feed,
            installer,
            timeout: config.network_timeout(),
            commands: tx.clone(),
            in_flight: HashMap::new(),
            generation: 0,
        };
        let handle = thread::Builder::new()
            .name("core-updater".into())
            .spawn(move || owner.run(rx))?;
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                commands: tx,
                owner: Some(handle),
            }),
        })
    }

    /// Opens the registry named by `config` and installs into its install root.
    pub fn from_config(
        config: &UpdaterConfig,
        feed: Arc<dyn CoreFeed>,
    ) -> Result<Self, UpdateError> {
        let store = match &config.store_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                RegistryStore::open(path)?
            }
            None => RegistryStore::in_memory(),
        };
        fs::create_dir_all(&config.install_root)?;
        let installer = DirectoryInstaller::new(&config.install_root);
        Self::spawn(Arc::new(store), feed, Arc::new(installer), config)
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.shared.store
    }

    pub fn snapshot(&self) -> Vec<ComponentDescriptor> {
        self.shared.store.snapshot()
    }

    pub fn find(&self, identity: &str) -> Option<ComponentDescriptor> {
        self.shared.store.find(identity)
    }

    pub fn has_backup(&self, identity: &str) -> bool {
        self.shared.store.has_backup(identity)
    }

    pub fn revision(&self) -> u64 {
        self.shared.store.revision()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.store.subscribe()
    }

    /// Registers cores the feed offers that the registry does not know yet.
    /// Resolves to the number of cores added.
    pub fn check_for_new_cores(&self) -> Pending<usize> {
        self.send(|responder| Command::CheckForNewCores { responder })
    }

    /// Refreshes available versions of every known core. Resolves to the number
    /// of cores that now offer an update.
    pub fn check_for_updates(&self) -> Pending<usize> {
        self.send(|responder| Command::CheckForUpdates { responder })
    }

    pub fn install_or_update(&self, identity: impl Into<String>) -> Pending<()> {
        let identity = identity.into();
        self.send(|responder| Command::InstallOrUpdate {
            identity,
            responder,
        })
    }

    /// Restores the backed-up version. Callers are expected to have obtained
    /// the user's consent first.
    pub fn revert(&self, identity: impl Into<String>) -> Pending<()> {
        let identity = identity.into();
        self.send(|responder| Command::Revert {
            identity,
            responder,
        })
    }

    fn send<T>(&self, build: impl FnOnce(Responder<T>) -> Command) -> Pending<T> {
        let (responder, pending) = Pending::channel();
        if self.shared.commands.send(build(responder)).is_err() {
            return Pending::ready(Err(UpdateError::UpdaterStopped));
        }
        pending
    }
}

struct Owner {
    store: Arc<RegistryStore>,
    feed: Arc<dyn CoreFeed>,
    installer: Arc<dyn CoreInstaller>,
    timeout: Duration,
    commands: Sender<Command>,
    in_flight: HashMap<String, InFlight>,
    generation: u64,
}

impl Owner {
    fn run(mut self, receiver: Receiver<Command>) {
        while let Ok(command) = receiver.recv() {
            match command {
                Command::Shutdown => break,
                Command::CheckForNewCores { responder } => self.check_for_new_cores(responder),
                Command::CheckForUpdates { responder } => self.check_for_updates(responder),
                Command::InstallOrUpdate {
                    identity,
                    responder,
                } => self.install_or_update(identity, responder),
                Command::Revert {
                    identity,
                    responder,
                } => self.revert(identity, responder),
                Command::Progress {
                    identity,
                    generation,
                    fraction,
                } => self.progress(&identity, generation, fraction),
                Command::Discovered { result, responder } => {
                    let outcome = result.and_then(|cores| {
                        self.store
                            .merge_discovered(cores)
                            .map_err(UpdateError::from)
                    });
                    if let Ok(added) = &outcome {
                        tracing::info!(added, "core discovery finished");
                    }
                    let _ = responder.send(outcome);
                }
                Command::ReleasesFetched { result, responder } => {
                    let outcome = result.and_then(|releases| self.apply_releases(releases));
                    let _ = responder.send(outcome);
                }
                Command::Finished {
                    identity,
                    generation,
                    result,
                } => self.finish(&identity, generation, result),
            }
        }
        if !self.in_flight.is_empty() {
            tracing::warn!(
                pending = self.in_flight.len(),
                "core updater stopped with operations in flight"
            );
        }
    }

    fn check_for_new_cores(&self, responder: Responder<usize>) {
        let feed = Arc::clone(&self.feed);
        let installer = Arc::clone(&self.installer);
        let commands = self.commands.clone();
        let timeout = self.timeout;
        let fallback = responder.clone();
        let spawned = thread::Builder::new()
            .name("core-discovery".into())
            .spawn(move || {
                let result = with_timeout(timeout, "core discovery", move || feed.discover())
                    .map(|cores| {
                        cores
                            .into_iter()
                            .map(|core| adopt_installed(&*installer, core))
                            .collect()
                    });
                let _ = commands.send(Command::Discovered { result, responder });
            });
        reply_if_not_spawned(spawned, fallback, "core discovery");
    }

    fn check_for_updates(&self, responder: Responder<usize>) {
        let identities = self.store.identities();
        let feed = Arc::clone(&self.feed);
        let commands = self.commands.clone();
        let timeout = self.timeout;
        let fallback = responder.clone();
        let spawned = thread::Builder::new()
            .name("core-update-check".into())
            .spawn(move || {
                let result = with_timeout(timeout, "update check", move || {
                    feed.releases(&identities)
                });
                let _ = commands.send(Command::ReleasesFetched { result, responder });
            });
        reply_if_not_spawned(spawned, fallback, "core update check");
    }

    fn apply_releases(&self, releases: Vec<Release>) -> Result<usize, UpdateError> {
        let releases: HashMap<String, Release> = releases
            .into_iter()
            .map(|release| (release.identity.clone(), release))
            .collect();
        let mut offering = 0;
        self.store.update_all(|core| {
            if core.is_downloading() {
                return;
            }
            if let Some(release) = releases.get(&core.identity) {
                core.available_version = Some(release.version.clone());
                core.published = release.published;
            }
            core.state = core.settled_state();
            if core.has_update() {
                offering += 1;
            }
        })?;
        tracing::info!(offering, "core update check finished");
        Ok(offering)
    }

    fn install_or_update(&mut self, identity: String, responder: Responder<()>) {
        let Some(core) = self.admit(&identity, &responder) else {
            return;
        };
        let installable = core.can_be_installed() || core.has_update() || core.offers_newer();
        if !installable {
            let _ = responder.send(Err(UpdateError::UpToDate(identity)));
            return;
        }

        let release = core.available_version.clone().map(|version| Release {
            identity: identity.clone(),
            version,
            published: core.published,
        });
        let generation = self.next_generation();
        let feed = Arc::clone(&self.feed);
        let installer = Arc::clone(&self.installer);
        let timeout = self.timeout;
        let progress = self.progress_reporter(&identity, generation);
        let worker_identity = identity.clone();
        self.begin(core, Operation::Install, generation, responder, move || {
            install_release(&feed, &*installer, timeout, &worker_identity, release, progress)
        });
    }

    fn revert(&mut self, identity: String, responder: Responder<()>) {
        let Some(core) = self.admit(&identity, &responder) else {
            return;
        };
        if !core.has_backup() {
            let _ = responder.send(Err(UpdateError::NoBackupAvailable(identity)));
            return;
        }
        let generation = self.next_generation();
        let installer = Arc::clone(&self.installer);
        let worker_identity = identity.clone();
        self.begin(core, Operation::Revert, generation, responder, move || {
            installer.revert(&worker_identity)
        });
    }

    /// Looks the core up and rejects it when unknown or busy.
    fn admit(&self, identity: &str, responder: &Responder<()>) -> Option<ComponentDescriptor> {
        let rejection = match self.store.find(identity) {
            None => UpdateError::UnknownIdentity(identity.to_string()),
            Some(core) if core.is_downloading() || self.in_flight.contains_key(identity) => {
                UpdateError::AlreadyInProgress(identity.to_string())
            }
            Some(core) => return Some(core),
        };
        tracing::debug!(identity, error = %rejection, "rejected core operation");
        let _ = responder.send(Err(rejection));
        None
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn begin<F>(
        &mut self,
        previous: ComponentDescriptor,
        operation: Operation,
        generation: u64,
        responder: Responder<()>,
        work: F,
    ) where
        F: FnOnce() -> Result<InstalledCore, UpdateError> + Send + 'static,
    {
        let identity = previous.identity.clone();
        let started = self.store.update(&identity, |core| {
            core.state = DownloadState::Downloading;
            core.progress = Some(0.0);
        });
        if let Err(err) = started {
            let _ = responder.send(Err(err.into()));
            return;
        }
        tracing::info!(%identity, ?operation, "core operation started");
        self.in_flight.insert(
            identity.clone(),
            InFlight {
                previous,
                operation,
                generation,
                responder,
            },
        );

        let commands = self.commands.clone();
        let worker_identity = identity.clone();
        let spawned = thread::Builder::new()
            .name(format!("core-{identity}"))
            .spawn(move || {
                let result = work();
                let _ = commands.send(Command::Finished {
                    identity: worker_identity,
                    generation,
                    result,
                });
            });
        if let Err(err) = spawned {
            self.finish(&identity, generation, Err(err.into()));
        }
    }

    fn finish(
        &mut self,
        identity: &str,
        generation: u64,
        result: Result<InstalledCore, UpdateError>,
    ) {
        match self.in_flight.get(identity) {
            Some(flight) if flight.generation == generation => {}
            _ => {
                tracing::warn!(
                    identity,
                    generation,
                    "completion for an operation no longer in flight"
                );
                return;
            }
        }
        let Some(flight) = self.in_flight.remove(identity) else {
            return;
        };
        let disk_changed = result.is_ok();
        let committed = result.and_then(|installed| {
            self.store
                .update(identity, |core| {
                    core.current_version = Some(installed.version.clone());
                    core.backup_version = installed.backup_version.clone();
                    core.progress = None;
                    core.state = match flight.operation {
                        Operation::Install => {
                            if !core.offers_newer() {
                                core.available_version = Some(installed.version.clone());
                            }
                            core.settled_state()
                        }
                        Operation::Revert => DownloadState::Installed,
                    };
                })
                .map(|_| ())
                .map_err(UpdateError::from)
        });

        match &committed {
            Ok(()) => {
                if let Err(err) = self.installer.settle(identity) {
                    tracing::warn!(identity, %err, "failed to clean up replaced core files");
                }
                tracing::info!(identity, operation = ?flight.operation, "core operation finished");
            }
            Err(err) => {
                tracing::warn!(
                    identity,
                    operation = ?flight.operation,
                    %err,
                    "core operation failed"
                );
                if disk_changed {
                    if let Err(undo) = self.installer.roll_back(identity) {
                        tracing::error!(identity, error = %undo, "failed to roll back core files");
                    }
                }
                if let Err(restore) = self.store.restore(flight.previous.clone()) {
                    tracing::error!(identity, error = %restore, "failed to restore core state");
                }
            }
        }
        let _ = flight.responder.send(committed);
    }

    fn progress(&self, identity: &str, generation: u64, fraction: f32) {
        match self.in_flight.get(identity) {
            Some(flight) if flight.generation == generation => {}
            _ => return,
        }
        let result = self.store.update_transient(identity, |core| {
            if core.is_downloading() {
                core.progress = Some(fraction);
            }
        });
        if let Err(err) = result {
            tracing::debug!(identity, error = %err, "dropping core download progress");
        }
    }

    fn progress_reporter(&self, identity: &str, generation: u64) -> ProgressReporter {
        let commands = self.commands.clone();
        let identity = identity.to_string();
        ProgressReporter::new(move |fraction| {
            let _ = commands.send(Command::Progress {
                identity: identity.clone(),
                generation,
                fraction,
            });
        })
    }
}

fn install_release(
    feed: &Arc<dyn CoreFeed>,
    installer: &dyn CoreInstaller,
    timeout: Duration,
    identity: &str,
    release: Option<Release>,
    progress: ProgressReporter,
) -> Result<InstalledCore, UpdateError> {
    let release = match release {
        Some(release) => release,
        None => {
            let lookup_feed = Arc::clone(feed);
            let identities = vec![identity.to_string()];
            with_timeout(timeout, "release lookup", move || {
                lookup_feed.releases(&identities)
            })?
            .into_iter()
            .find(|release| release.identity == identity)
            .ok_or_else(|| UpdateError::Network(format!("feed offers no release of {identity}")))?
        }
    };
    let fetch_feed = Arc::clone(feed);
    let fetch_release = release.clone();
    let artifact = with_timeout(timeout, "download", move || {
        fetch_feed.fetch(&fetch_release, &progress)
    })?;
    installer.install(&release, &artifact)
}

/// Describes a discovered core, marked installed when the installer already
/// has it on disk.
fn adopt_installed(installer: &dyn CoreInstaller, core: FeedCore) -> ComponentDescriptor {
    let identity = core.identity.clone();
    let descriptor = core.into_descriptor();
    match installer.installed(&identity) {
        Ok(Some(installed)) => {
            descriptor.with_installed(installed.version, installed.backup_version)
        }
        Ok(None) => descriptor,
        Err(err) => {
            tracing::warn!(?err, %identity, "could not inspect installed core");
            descriptor
        }
    }
}

/// Resolves a check whose worker thread could not be started.
fn reply_if_not_spawned<T>(
    spawned: io::Result<JoinHandle<()>>,
    fallback: Responder<T>,
    what: &str,
) {
    if let Err(err) = spawned {
        tracing::error!(?err, "failed to spawn {what} worker");
        let _ = fallback.send(Err(err.into()));
    }
}

/// Runs a feed call on its own thread and gives up waiting after `timeout`.
fn with_timeout<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("core-feed".into())
        .spawn(move || {
            let _ = tx.send(call());
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(UpdateError::Network(format!(
            "{what} timed out after {}s",
            timeout.as_secs()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(UpdateError::Network(format!("{what} ended without a response")))
        }
    }
}
