//! Lifecycle management for downloadable emulator cores.
//!
//! [`CoreUpdater`] owns every mutation of a [`RegistryStore`]: commands are
//! queued to a dedicated owner thread, feed and disk work runs on worker
//! threads, and each resulting state transition is applied and announced on
//! the owner thread before the caller's [`Pending`] result resolves. The update
//! feed and the on-disk install step are pluggable through [`CoreFeed`] and
//! [`CoreInstaller`].

mod config;
mod error;
mod feed;
mod installer;
mod manager;
mod pending;

pub use config::UpdaterConfig;
pub use error::UpdateError;
pub use feed::{Artifact, CoreFeed, FeedCore, ProgressReporter, Release, StaticFeed};
pub use installer::{CoreInstaller, DirectoryInstaller, InstallReceipt, InstalledCore};
pub use manager::CoreUpdater;
pub use pending::Pending;

pub use emucore_registry::{
    ComponentDescriptor, CoreAction, DownloadState, RegistryChanged, RegistryStore, StoreError,
    Subscription,
};
