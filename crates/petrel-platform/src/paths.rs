use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine cache directory")]
    CacheDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

pub struct AppPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build application paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory (for example the user
    /// home/config/cache/data directory) cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().ok_or(AppPathsError::HomeDirUnavailable)?;
            Ok(Self {
                config_dir: home.join("Library/Application Support/petrel"),
                cache_dir: home.join("Library/Caches/petrel"),
                data_dir: home.join("Library/Application Support/petrel"),
            })
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(Self {
                config_dir: dirs::config_dir()
                    .ok_or(AppPathsError::ConfigDirUnavailable)?
                    .join("petrel"),
                cache_dir: dirs::cache_dir()
                    .ok_or(AppPathsError::CacheDirUnavailable)?
                    .join("petrel"),
                data_dir: dirs::data_dir()
                    .ok_or(AppPathsError::DataDirUnavailable)?
                    .join("petrel"),
            })
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn device_info_file(&self) -> PathBuf {
        self.config_dir.join("device-info.json")
    }

    /// Key/value bookkeeping that must survive restarts (pending installer
    /// state and similar markers).
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    #[must_use]
    pub fn ecs_cache_file(&self) -> PathBuf {
        self.cache_dir.join("ecs-cache.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("petrel.log")
    }

    /// Directory where downloaded installers are kept between runs.
    #[must_use]
    pub fn installer_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Ensure all application directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AppPaths;

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths {
            config_dir: temp.path().join("config"),
            cache_dir: temp.path().join("cache"),
            data_dir: temp.path().join("data"),
        };

        paths.ensure_dirs().expect("directories should be created");

        assert!(paths.config_dir.is_dir());
        assert!(paths.cache_dir.is_dir());
        assert!(paths.data_dir.is_dir());
    }

    #[test]
    fn file_paths_live_under_their_base_dirs() {
        let paths = AppPaths {
            config_dir: "/tmp/c".into(),
            cache_dir: "/tmp/k".into(),
            data_dir: "/tmp/d".into(),
        };

        assert!(paths.settings_file().starts_with(&paths.config_dir));
        assert!(paths.device_info_file().starts_with(&paths.config_dir));
        assert!(paths.state_file().starts_with(&paths.config_dir));
        assert!(paths.ecs_cache_file().starts_with(&paths.cache_dir));
        assert!(paths.log_file().starts_with(&paths.data_dir));
    }
}
