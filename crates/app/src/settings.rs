use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use courier_engine::{DEFAULT_FAILURE_NOTICE, DEFAULT_INSTRUCTION, EngineConfig};
use courier_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig, SCRIPTED_PROVIDER_ID};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_DISPLAY_NAME: &str = "You";
pub const SETTINGS_DIRECTORY_NAME: &str = "courier";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "COURIER_";
/// Consulted only when no key came from the file or `COURIER_API_KEY`.
pub const FALLBACK_API_KEY_VAR: &str = "API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_instruction")]
    pub default_instruction: String,
    #[serde(default = "default_failure_notice")]
    pub failure_notice: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            max_tokens: None,
            default_instruction: default_instruction(),
            failure_notice: default_failure_notice(),
            display_name: default_display_name(),
        }
    }
}

impl Settings {
    /// `None` when the provider needs a key and none is configured.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.is_empty() && self.provider_id != SCRIPTED_PROVIDER_ID {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
        ))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_id: self.model.clone(),
            default_instruction: self.default_instruction.clone(),
            failure_notice: self.failure_notice.clone(),
            max_tokens: self.max_tokens,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.default_instruction = non_blank_or(self.default_instruction, default_instruction);
        self.failure_notice = non_blank_or(self.failure_notice, default_failure_notice);
        self.display_name = non_blank_or(self.display_name, default_display_name);
        self.max_tokens = self.max_tokens.filter(|max_tokens| *max_tokens > 0);
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".courier"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let figment = Self::figment(&config_path).merge(Env::prefixed(ENV_PREFIX));
        let mut settings = Self::extract(figment, &config_path);
        if settings.api_key.is_empty()
            && let Ok(api_key) = std::env::var(FALLBACK_API_KEY_VAR)
        {
            settings.api_key = api_key.trim().to_string();
        }

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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn figment(path: &Path) -> Figment {
        let figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment.merge(Json::file(path))
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            figment
        }
    }

    fn extract(figment: Figment, path: &Path) -> Settings {
        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}

fn default_failure_notice() -> String {
    DEFAULT_FAILURE_NOTICE.to_string()
}

fn default_display_name() -> String {
    DEFAULT_DISPLAY_NAME.to_string()
}
