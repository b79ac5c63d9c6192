use anyhow::{Context, Result};
use chatmux::ws::WsConfig;
use chatmux::{Mode, ModelDescriptor, ModelKwargs, RunOptions, StaticCatalog, WorkspaceDescriptor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    url = "wss://chat.example/socket"
//
//   env var:         CHATMUX_CONNECTION__URL=wss://...   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub model: ModelFileConfig,
    #[serde(default)]
    pub model_kwargs: ModelKwargsFileConfig,
    #[serde(default)]
    pub catalog: CatalogFileConfig,
}

/// Lives under `[connection]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Sent as the `token` query parameter.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            outbound_capacity: default_outbound_capacity(),
            inbound_capacity: default_inbound_capacity(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl ConnectionFileConfig {
    pub fn ws_config(&self, url_override: Option<&str>) -> WsConfig {
        let base = url_override.unwrap_or(&self.url);
        let url = match &self.token {
            Some(token) if !token.is_empty() => {
                let sep = if base.contains('?') { '&' } else { '?' };
                format!("{base}{sep}token={token}")
            }
            _ => base.to_string(),
        };
        WsConfig {
            url,
            outbound_capacity: self.outbound_capacity,
            inbound_capacity: self.inbound_capacity,
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

/// Lives under `[model]` in config.toml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelFileConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
}

/// Lives under `[model_kwargs]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelKwargsFileConfig {
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for ModelKwargsFileConfig {
    fn default() -> Self {
        Self {
            streaming: default_streaming(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

impl From<&ModelKwargsFileConfig> for ModelKwargs {
    fn from(fc: &ModelKwargsFileConfig) -> Self {
        Self {
            streaming: fc.streaming,
            max_tokens: fc.max_tokens,
            temperature: fc.temperature,
            top_p: fc.top_p,
        }
    }
}

/// `[[catalog.models]]` and `[[catalog.workspaces]]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogFileConfig {
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceDescriptor>,
}

impl FileConfig {
    pub fn run_options(&self) -> RunOptions {
        let model = match (&self.model.provider, &self.model.name) {
            (Some(provider), Some(name)) => Some(chatmux::ModelSelection::new(provider, name)),
            _ => None,
        };
        RunOptions {
            model,
            workspace_id: self.model.workspace_id.clone(),
            mode: self.model.mode,
            model_kwargs: Some(ModelKwargs::from(&self.model_kwargs)),
            files: Vec::new(),
        }
    }

    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::new(self.catalog.models.clone(), self.catalog.workspaces.clone())
    }

    /// The effective config as TOML, with the token masked.
    pub fn to_display_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.connection.token.is_some() {
            shown.connection.token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to render config as TOML")
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/socket".to_string()
}
fn default_outbound_capacity() -> usize {
    64
}
fn default_inbound_capacity() -> usize {
    256
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_streaming() -> bool {
    true
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.6
}
fn default_top_p() -> f32 {
    0.9
}

/// `--config-dir`, or `<platform config dir>/chatmux`.
pub fn resolve_config_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    match custom_dir {
        Some(dir) => Ok(dir),
        None => Ok(dirs::config_dir()
            .context("Could not find a config directory")?
            .join("chatmux")),
    }
}

/// Build a figment that layers: defaults → config.toml → CHATMUX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHATMUX_MODEL__PROVIDER=bedrock`  →  `model.provider = "bedrock"`
///   `CHATMUX_CONNECTION__RECONNECT_MAX_MS=5000`  →  `connection.reconnect_max_ms = 5000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHATMUX_").split("__"))
}
