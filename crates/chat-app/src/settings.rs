use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use palaver_client::ServiceConfig;
use palaver_core::{DEFAULT_MAX_POLL_FAILURES, EngineConfig, EngineTexts};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "palaver";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SESSION_FILE_NAME: &str = "session.json";
pub const ENV_PREFIX: &str = "PALAVER_";

/// Everything the terminal client reads at startup.
///
/// Environment overrides use `__` for nesting, e.g. `PALAVER_SERVICE__ENDPOINT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    #[serde(default = "default_require_privacy_consent")]
    pub require_privacy_consent: bool,
    #[serde(default)]
    pub connection_lost_text: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            require_privacy_consent: default_require_privacy_consent(),
            connection_lost_text: EngineTexts::default().connection_lost,
        }
    }
}

impl AppSettings {
    /// Without an endpoint the client talks to the built-in demo backend.
    pub fn is_demo(&self) -> bool {
        !self.service.is_configured()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_poll_failures(self.max_poll_failures)
            .with_privacy_consent(self.require_privacy_consent)
            .with_connection_lost_text(self.connection_lost_text.clone())
    }

    pub fn normalized(mut self) -> Self {
        self.service = self.service.normalized();
        self.max_poll_failures = self.max_poll_failures.max(1);
        self.connection_lost_text = self.connection_lost_text.trim().to_string();
        if self.connection_lost_text.is_empty() {
            self.connection_lost_text = EngineTexts::default().connection_lost;
        }
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".palaver"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Where the resumable session id is kept, next to the settings file.
    pub fn default_session_path() -> PathBuf {
        Self::default_config_dir().join(SESSION_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_max_poll_failures() -> u32 {
    DEFAULT_MAX_POLL_FAILURES
}

// The hosted widget always asked for consent before the first message.
fn default_require_privacy_consent() -> bool {
    true
}
