use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::is_newer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum DownloadState {
    /// Known, but the last operation on it was interrupted; resolved by the next update check.
    Idle,
    Downloading,
    Installed,
    UpdateAvailable,
    NotInstalled,
}

impl DownloadState {
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Downloading)
    }
}

/// The one action a core row offers, in the priority order the preferences pane uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreAction {
    Busy,
    Install,
    Update,
    Revert,
    Check,
}

impl CoreAction {
    pub fn label(self) -> &'static str {
        match self {
            CoreAction::Busy => "...",
            CoreAction::Install => "Install",
            CoreAction::Update => "Update",
            CoreAction::Revert => "Revert",
            CoreAction::Check => "Check",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentDescriptor {
    pub identity: String,
    pub display_name: String,
    pub current_version: Option<String>,
    pub available_version: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub systems: Vec<String>,
    pub state: DownloadState,
    pub backup_version: Option<String>,
    #[serde(skip)]
    pub progress: Option<f32>,
}

impl ComponentDescriptor {
    pub fn new(
        identity: impl Into<String>,
        display_name: impl Into<String>,
        systems: Vec<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            current_version: None,
            available_version: None,
            published: None,
            systems,
            state: DownloadState::NotInstalled,
            backup_version: None,
            progress: None,
        }
    }

    /// Marks the descriptor as installed at `version`, as found on disk.
    pub fn with_installed(mut self, version: impl Into<String>, backup: Option<String>) -> Self {
        let version = version.into();
        self.available_version = Some(version.clone());
        self.current_version = Some(version);
        self.backup_version = backup;
        self.state = DownloadState::Installed;
        self
    }

    pub fn is_installed(&self) -> bool {
        self.current_version.is_some()
    }

    pub fn is_downloading(&self) -> bool {
        self.state.is_busy()
    }

    pub fn can_be_installed(&self) -> bool {
        !self.is_installed() && !self.is_downloading()
    }

    pub fn has_update(&self) -> bool {
        self.state == DownloadState::UpdateAvailable
    }

    pub fn has_backup(&self) -> bool {
        self.backup_version.is_some()
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.available_version
            .as_deref()
            .or(self.current_version.as_deref())
    }

    /// Whether the feed offers something newer than what is installed.
    pub fn offers_newer(&self) -> bool {
        match (&self.available_version, &self.current_version) {
            (Some(available), Some(current)) => is_newer(available, current),
            _ => false,
        }
    }

    /// The state implied by the versions alone, ignoring any in-flight work.
    pub fn settled_state(&self) -> DownloadState {
        if !self.is_installed() {
            DownloadState::NotInstalled
        } else if self.offers_newer() {
            DownloadState::UpdateAvailable
        } else {
            DownloadState::Installed
        }
    }

    pub fn action(&self) -> CoreAction {
        if self.is_downloading() {
            CoreAction::Busy
        } else if self.can_be_installed() {
            CoreAction::Install
        } else if self.has_update() || self.offers_newer() {
            CoreAction::Update
        } else if self.has_backup() {
            CoreAction::Revert
        } else {
            CoreAction::Check
        }
    }

    pub fn system_list(&self) -> String {
        self.systems.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn snes() -> ComponentDescriptor {
        ComponentDescriptor::new(
            "org.emucores.snes9x",
            "Snes9x",
            vec!["Super Nintendo".into(), "Satellaview".into()],
        )
    }

    #[test]
    fn new_descriptor_offers_install() {
        let core = snes();
        assert_eq!(core.state, DownloadState::NotInstalled);
        assert!(core.can_be_installed());
        assert_eq!(core.action(), CoreAction::Install);
        assert_eq!(core.latest_version(), None);
        assert_eq!(core.system_list(), "Super Nintendo, Satellaview");
    }

    #[test]
    fn action_priority_follows_state() {
        let mut core = snes().with_installed("1.60", Some("1.59".into()));
        assert_eq!(core.action(), CoreAction::Revert);

        core.state = DownloadState::UpdateAvailable;
        assert_eq!(core.action(), CoreAction::Update);

        core.state = DownloadState::Downloading;
        assert_eq!(core.action(), CoreAction::Busy);
        assert!(!core.can_be_installed());

        core.state = DownloadState::Installed;
        core.backup_version = None;
        assert_eq!(core.action(), CoreAction::Check);
    }

    #[test]
    fn settled_state_compares_versions() {
        let mut core = snes();
        assert_eq!(core.settled_state(), DownloadState::NotInstalled);

        core = core.with_installed("1.60", None);
        assert_eq!(core.settled_state(), DownloadState::Installed);

        core.available_version = Some("1.62".into());
        assert!(core.offers_newer());
        assert_eq!(core.settled_state(), DownloadState::UpdateAvailable);
        assert_eq!(core.latest_version(), Some("1.62"));
    }

    #[test]
    fn known_newer_version_offers_update_before_backup() {
        let mut core = snes().with_installed("1.60", None);
        core.available_version = Some("1.62".into());
        core.backup_version = Some("1.59".into());
        assert_eq!(core.state, DownloadState::Installed);
        assert_eq!(core.action(), CoreAction::Update);
    }

    #[test]
    fn progress_is_not_persisted() {
        let mut core = snes();
        core.state = DownloadState::Downloading;
        core.progress = Some(0.5);
        let json = serde_json::to_string(&core).unwrap();
        let restored: ComponentDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.progress, None);
        assert_eq!(restored.state, DownloadState::Downloading);
    }
}
