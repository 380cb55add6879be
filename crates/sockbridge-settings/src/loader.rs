//! Layered configuration loading.
//!
//! Merges configuration from, in increasing precedence:
//! 1. Global: `~/.config/sockbridge/sockbridge.toml`
//! 2. Project: `<workspace>/.sockbridge/sockbridge.toml`
//! 3. An explicit file, when one is given

use crate::{BridgeSettings, SettingsError};
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "sockbridge.toml";
const DIR_NAME: &str = "sockbridge";
const PROJECT_DIR_NAME: &str = ".sockbridge";

/// Loads and merges `BridgeSettings` from global, project and explicit files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged implicit configuration for the given workspace.
    ///
    /// Missing files are skipped. A malformed file logs a warning and is
    /// treated as absent.
    pub fn load(workspace: &Path) -> BridgeSettings {
        let global = Self::load_optional(&Self::global_config_path());
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Load with the CLI's layering rules.
    ///
    /// Implicit files are skipped when `implicit` is false. The explicit
    /// file, if any, must exist and parse.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` or `SettingsError::ParseError` for the
    /// explicit file.
    pub fn load_layered(
        workspace: &Path,
        explicit: Option<&Path>,
        implicit: bool,
    ) -> Result<BridgeSettings, SettingsError> {
        let base = if implicit {
            Self::load(workspace)
        } else {
            BridgeSettings::default()
        };
        match explicit {
            Some(path) => Ok(base.merge(BridgeSettings::load(path)?)),
            None => Ok(base),
        }
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join(DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(PROJECT_DIR_NAME))
            .join(FILE_NAME)
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(PROJECT_DIR_NAME).join(FILE_NAME)
    }

    fn load_optional(path: &Path) -> BridgeSettings {
        if !path.exists() {
            return BridgeSettings::default();
        }
        match BridgeSettings::load(path) {
            Ok(settings) => {
                tracing::debug!(path = %path.display(), "Loaded config file");
                settings
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Ignoring unreadable config file");
                BridgeSettings::default()
            }
        }
    }
}
