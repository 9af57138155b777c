use anyhow::{Context, Result};
use matura_core::{Behavior, Identity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on how many past turns are fed to the completion service.
pub(crate) const MAX_HISTORY_LIMIT: usize = 20;

const CONFIG_FILE: &str = "matura.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProviderConfig {
    #[serde(default = "default_provider")]
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_provider_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider(),
            model: default_model(),
            api_key_env: default_provider_key_env(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ChannelKind {
    #[default]
    Evolution,
    /// Log sends instead of delivering them.
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChannelConfig {
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default = "default_channel_url")]
    pub base_url: String,
    #[serde(default = "default_channel_key_env")]
    pub api_key_env: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::default(),
            base_url: default_channel_url(),
            api_key_env: default_channel_key_env(),
        }
    }
}

/// Delay windows, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PacingConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_typing_min")]
    pub typing_min_ms: u64,
    #[serde(default = "default_typing_max")]
    pub typing_max_ms: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_config_backoff")]
    pub max_config_backoff_ms: u64,
    /// Consecutive configuration failures before the error is surfaced on
    /// the pair.
    #[serde(default = "default_config_error_threshold")]
    pub config_error_threshold: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            typing_min_ms: default_typing_min(),
            typing_max_ms: default_typing_max(),
            retry_backoff_ms: default_retry_backoff(),
            max_config_backoff_ms: default_max_config_backoff(),
            config_error_threshold: default_config_error_threshold(),
        }
    }
}

impl PacingConfig {
    pub(crate) fn turn_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub(crate) fn typing_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.typing_min_ms),
            Duration::from_millis(self.typing_max_ms),
        )
    }

    pub(crate) fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub(crate) fn max_config_backoff(&self) -> Duration {
        Duration::from_millis(self.max_config_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GenerationConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_generation_timeout")]
    pub timeout_ms: u64,
    /// Sent verbatim as the very first turn of every pair.
    #[serde(default)]
    pub announcement: Option<String>,
    #[serde(default = "default_fallback_phrases")]
    pub fallback_phrases: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_lines: default_max_lines(),
            max_chars: default_max_chars(),
            timeout_ms: default_generation_timeout(),
            announcement: None,
            fallback_phrases: default_fallback_phrases(),
        }
    }
}

impl GenerationConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DispatchConfig {
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dispatch_timeout(),
        }
    }
}

impl DispatchConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeaseConfig {
    /// Lease held by a loop driver, renewed every iteration.
    #[serde(default = "default_loop_lease")]
    pub loop_ttl_ms: u64,
    /// Lease taken by a sweep for a single advance.
    #[serde(default = "default_sweep_lease")]
    pub sweep_ttl_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            loop_ttl_ms: default_loop_lease(),
            sweep_ttl_ms: default_sweep_lease(),
        }
    }
}

impl LeaseConfig {
    pub(crate) fn loop_ttl(&self) -> Duration {
        Duration::from_millis(self.loop_ttl_ms)
    }

    pub(crate) fn sweep_ttl(&self) -> Duration {
        Duration::from_millis(self.sweep_ttl_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SweepConfig {
    /// Cron expression (5, 6 or 7 fields) for in-process sweeps.
    #[serde(default)]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct WebhookConfig {
    /// Address for the HTTP hook server (`POST /webhook`, `POST /sweep`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Cut the inter-turn sleep short when the partner's reply arrives.
    #[serde(default)]
    pub wake_on_reply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IdentityConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

impl IdentityConfig {
    pub(crate) fn to_identity(&self) -> Identity {
        let behavior = match (&self.prompt, &self.script) {
            (Some(prompt), _) => Behavior::Prompt(prompt.clone()),
            (None, Some(script)) => Behavior::Script(script.clone()),
            (None, None) => Behavior::Unset,
        };
        Identity {
            name: self.name.clone(),
            address: self.address.clone(),
            instance: self.instance.clone(),
            behavior,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScriptConfig {
    pub id: String,
    pub messages: Vec<String>,
}

fn default_store_path() -> String {
    "./data/matura.db".to_owned()
}

fn default_provider() -> String {
    "anthropic".to_owned()
}

fn default_model() -> String {
    "claude-3-5-haiku-latest".to_owned()
}

fn default_provider_key_env() -> String {
    "ANTHROPIC_API_KEY".to_owned()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_channel_url() -> String {
    "http://localhost:8080".to_owned()
}

fn default_channel_key_env() -> String {
    "EVOLUTION_API_KEY".to_owned()
}

fn default_min_delay() -> u64 {
    12_000
}

fn default_max_delay() -> u64 {
    20_000
}

fn default_typing_min() -> u64 {
    1_000
}

fn default_typing_max() -> u64 {
    4_000
}

fn default_retry_backoff() -> u64 {
    5_000
}

fn default_max_config_backoff() -> u64 {
    300_000
}

fn default_config_error_threshold() -> u32 {
    3
}

fn default_history_limit() -> usize {
    MAX_HISTORY_LIMIT
}

fn default_max_lines() -> usize {
    3
}

fn default_max_chars() -> usize {
    280
}

fn default_generation_timeout() -> u64 {
    30_000
}

fn default_fallback_phrases() -> Vec<String> {
    ["haha", "verdade", "sério?", "entendi", "boa!"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_dispatch_timeout() -> u64 {
    15_000
}

fn default_loop_lease() -> u64 {
    120_000
}

fn default_sweep_lease() -> u64 {
    60_000
}

impl Config {
    /// Load and validate a TOML config file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        debug!(
            path = %path.display(),
            identities = config.identities.len(),
            scripts = config.scripts.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let pacing = &self.pacing;
        anyhow::ensure!(
            pacing.min_delay_ms <= pacing.max_delay_ms,
            "pacing.min_delay_ms ({}) exceeds pacing.max_delay_ms ({})",
            pacing.min_delay_ms,
            pacing.max_delay_ms
        );
        anyhow::ensure!(
            pacing.typing_min_ms <= pacing.typing_max_ms,
            "pacing.typing_min_ms ({}) exceeds pacing.typing_max_ms ({})",
            pacing.typing_min_ms,
            pacing.typing_max_ms
        );
        anyhow::ensure!(
            pacing.retry_backoff_ms < pacing.min_delay_ms,
            "pacing.retry_backoff_ms ({}) must be shorter than pacing.min_delay_ms ({})",
            pacing.retry_backoff_ms,
            pacing.min_delay_ms
        );
        anyhow::ensure!(
            pacing.max_config_backoff_ms >= pacing.retry_backoff_ms,
            "pacing.max_config_backoff_ms must be at least pacing.retry_backoff_ms"
        );
        anyhow::ensure!(
            pacing.config_error_threshold > 0,
            "pacing.config_error_threshold must be positive"
        );

        let generation = &self.generation;
        anyhow::ensure!(
            generation.history_limit <= MAX_HISTORY_LIMIT,
            "generation.history_limit ({}) exceeds {MAX_HISTORY_LIMIT}",
            generation.history_limit
        );
        anyhow::ensure!(
            generation.max_lines > 0 && generation.max_chars > 0,
            "generation.max_lines and generation.max_chars must be positive"
        );
        anyhow::ensure!(
            generation.fallback_phrases.iter().any(|p| !p.trim().is_empty()),
            "generation.fallback_phrases needs at least one phrase"
        );

        anyhow::ensure!(
            self.lease.loop_ttl_ms > pacing.max_delay_ms.saturating_add(pacing.typing_max_ms),
            "lease.loop_ttl_ms must exceed pacing.max_delay_ms + pacing.typing_max_ms"
        );
        anyhow::ensure!(self.lease.sweep_ttl_ms > 0, "lease.sweep_ttl_ms must be positive");

        let mut names = HashSet::new();
        for identity in &self.identities {
            anyhow::ensure!(
                names.insert(identity.name.as_str()),
                "duplicate identity name: {}",
                identity.name
            );
            anyhow::ensure!(
                identity.prompt.is_none() || identity.script.is_none(),
                "identity {} sets both prompt and script",
                identity.name
            );
        }

        let mut script_ids = HashSet::new();
        for script in &self.scripts {
            anyhow::ensure!(
                script_ids.insert(script.id.as_str()),
                "duplicate script id: {}",
                script.id
            );
        }
        for identity in &self.identities {
            if let Some(ref script) = identity.script {
                anyhow::ensure!(
                    script_ids.contains(script.as_str()),
                    "identity {} references unknown script {script}",
                    identity.name
                );
            }
        }

        if let Some(ref expr) = self.sweep.cron {
            crate::sweep::parse_cron(expr)
                .with_context(|| format!("invalid sweep.cron expression: {expr}"))?;
        }

        if let Some(ref listen) = self.webhook.listen {
            listen
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid webhook.listen address: {listen}"))?;
        }

        Ok(())
    }

    /// Resolve a relative store path against the config file's directory.
    pub(crate) fn store_path(&self, base_dir: &Path) -> PathBuf {
        let path = PathBuf::from(&self.store.path);
        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        // Check current directory
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return local;
        }

        // Check XDG config
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("matura").join(CONFIG_FILE);
            if xdg.exists() {
                return xdg;
            }
        }

        // Check ~/.config/matura
        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home)
                .join(".config/matura")
                .join(CONFIG_FILE);
            if home_config.exists() {
                return home_config;
            }
        }

        // Default to local
        local
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.store.path, "./data/matura.db");
        assert_eq!(config.provider.name, "anthropic");
        assert_eq!(config.provider.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.channel.kind, ChannelKind::Evolution);
        assert_eq!(config.pacing.min_delay_ms, 12_000);
        assert_eq!(config.pacing.max_delay_ms, 20_000);
        assert_eq!(config.generation.history_limit, MAX_HISTORY_LIMIT);
        assert!(config.generation.announcement.is_none());
        assert!(!config.webhook.wake_on_reply);
        assert!(config.sweep.cron.is_none());
        assert!(config.identities.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let config = parse(
            r#"
[store]
path = "/var/lib/matura/pairs.db"

[provider]
model = "anthropic/claude-3-5-haiku-latest"
max_tokens = 128

[channel]
kind = "loopback"

[pacing]
min_delay_ms = 1000
max_delay_ms = 2000
typing_min_ms = 0
typing_max_ms = 500
retry_backoff_ms = 200

[generation]
history_limit = 10
announcement = "oi! chip novo aqui"
fallback_phrases = ["kkk", "sim"]

[sweep]
cron = "*/5 * * * *"

[webhook]
listen = "127.0.0.1:8089"
wake_on_reply = true

[[identities]]
name = "alice"
address = "+55 11 98765-4321"
instance = "chip-a"
prompt = "You are Alice."

[[identities]]
name = "bob"
address = "5511912345678"
instance = "chip-b"
script = "smalltalk"

[[scripts]]
id = "smalltalk"
messages = ["oi", "tudo bem?", "bora"]
"#,
        );

        config.validate().unwrap();
        assert_eq!(config.channel.kind, ChannelKind::Loopback);
        assert_eq!(config.provider.max_tokens, 128);
        assert_eq!(config.generation.history_limit, 10);
        assert_eq!(
            config.generation.announcement.as_deref(),
            Some("oi! chip novo aqui")
        );
        assert_eq!(config.sweep.cron.as_deref(), Some("*/5 * * * *"));
        assert!(config.webhook.wake_on_reply);
        assert_eq!(config.identities.len(), 2);

        let alice = config.identities[0].to_identity();
        assert_eq!(alice.prompt(), Some("You are Alice."));
        let bob = config.identities[1].to_identity();
        assert_eq!(bob.behavior, Behavior::Script("smalltalk".to_owned()));
        assert_eq!(config.scripts[0].messages.len(), 3);
        assert_eq!(
            config.store_path(Path::new("/unused")),
            PathBuf::from("/var/lib/matura/pairs.db")
        );
    }

    #[test]
    fn identity_without_behaviour_is_unset() {
        let config = parse(
            r#"
[[identities]]
name = "carol"
"#,
        );
        let carol = config.identities[0].to_identity();
        assert_eq!(carol.behavior, Behavior::Unset);
        assert!(carol.address.is_none());
    }

    #[test]
    fn validate_rejects_inverted_delay_window() {
        let mut config = Config::default();
        config.pacing.min_delay_ms = 30_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_delay_ms"), "{err}");
    }

    #[test]
    fn validate_rejects_retry_backoff_not_shorter_than_min_delay() {
        let mut config = Config::default();
        config.pacing.retry_backoff_ms = config.pacing.min_delay_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_backoff_ms"), "{err}");
    }

    #[test]
    fn validate_caps_history_limit() {
        let mut config = Config::default();
        config.generation.history_limit = 21;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("history_limit"), "{err}");
    }

    #[test]
    fn validate_rejects_duplicate_identity() {
        let config = parse(
            r#"
[[identities]]
name = "alice"

[[identities]]
name = "alice"
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate identity"), "{err}");
    }

    #[test]
    fn validate_rejects_unknown_script_reference() {
        let config = parse(
            r#"
[[identities]]
name = "alice"
script = "missing"
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown script"), "{err}");
    }

    #[test]
    fn validate_rejects_bad_cron_and_listen_address() {
        let mut config = Config::default();
        config.sweep.cron = Some("not a cron".to_owned());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.webhook.listen = Some("nowhere".to_owned());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_loop_lease() {
        let mut config = Config::default();
        config.lease.loop_ttl_ms = config.pacing.max_delay_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loop_ttl_ms"), "{err}");
    }

    #[test]
    fn validate_handles_huge_pacing_values() {
        let mut config = Config::default();
        config.pacing.max_delay_ms = u64::MAX;
        config.pacing.typing_max_ms = u64::MAX;
        config.lease.loop_ttl_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loop_ttl_ms"), "{err}");
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matura.toml");
        std::fs::write(&path, "[pacing]\nmin_delay_ms = 5\nmax_delay_ms = 1\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("min_delay_ms"), "{err:#}");

        std::fs::write(&path, "[store]\npath = \"pairs.db\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.store_path(dir.path()), dir.path().join("pairs.db"));
    }

    #[test]
    fn find_config_path_prefers_explicit() {
        assert_eq!(
            Config::find_config_path(Some("/etc/matura.toml")),
            PathBuf::from("/etc/matura.toml")
        );
    }
}
