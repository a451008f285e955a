//! Typed, bounded configuration (spec §6.5).
//!
//! A single struct with `#[serde(default)]` throughout: every option has a
//! default, and `Config::validate` is the single place invalid values are
//! rejected on startup with a precise error, rather than scattering
//! `unwrap`s across the codebase.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub allowed_user_ids: Vec<i64>,
    pub workspace_dir: String,
    pub state_db_path: String,
    pub audit_log_path: String,
    pub idempotency_ttl_secs: i64,
    pub clarification_ttl_secs: i64,
    pub approval_ttl_secs: i64,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub router: RouterConfig,
    pub security: SecurityConfig,
    pub progress_notices: bool,
    pub gateway: GatewayConfig,
    pub channels: ChannelsConfig,
    pub providers: ProvidersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_user_ids: Vec::new(),
            workspace_dir: "~/.switchboard/workspace".into(),
            state_db_path: "~/.switchboard/state.db".into(),
            audit_log_path: "~/.switchboard/audit.log".into(),
            idempotency_ttl_secs: 86_400,
            clarification_ttl_secs: 300,
            approval_ttl_secs: 300,
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            router: RouterConfig::default(),
            security: SecurityConfig::default(),
            progress_notices: true,
            gateway: GatewayConfig::default(),
            channels: ChannelsConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_per_chat: usize,
    pub max_total: usize,
    pub drain_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_per_chat: 30, max_total: 400, drain_timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub handler_timeout_secs: u64,
    pub circuit_threshold: u32,
    pub circuit_open_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 45,
            circuit_threshold: 3,
            circuit_open_secs: 60,
            retry_attempts: 3,
            retry_base_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_secs: 15 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AbConfig {
    pub split_percent: u32,
    pub variant_b_alpha: f64,
    pub variant_b_min_gap: f64,
    pub variant_b_threshold_shift: f64,
}

impl Default for AbConfig {
    fn default() -> Self {
        Self { split_percent: 0, variant_b_alpha: 0.5, variant_b_min_gap: 0.08, variant_b_threshold_shift: 0.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub enabled: bool,
    pub split_percent: u32,
    pub version_id: Option<String>,
    pub min_accuracy: f64,
    pub breaches_to_disable: u32,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self { enabled: false, split_percent: 0, version_id: None, min_accuracy: 0.6, breaches_to_disable: 3 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    pub sample_percent: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HardNegativeConfig {
    pub interval_secs: u64,
    pub max_per_route: usize,
}

impl Default for HardNegativeConfig {
    fn default() -> Self {
        Self { interval_secs: 3600, max_per_route: 50 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    pub hybrid_alpha: f64,
    pub min_score_gap: f64,
    pub per_route_alpha: HashMap<String, f64>,
    pub ab: AbConfig,
    pub canary: CanaryConfig,
    pub shadow: ShadowConfig,
    pub hard_negative: HardNegativeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityProfileChoice {
    Safe,
    Standard,
    FullControl,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub profile: SecurityProfileChoice,
    pub allow_ai_shell: bool,
    pub allow_reboot: bool,
    pub force_approval_mode: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            profile: SecurityProfileChoice::Standard,
            allow_ai_shell: false,
            allow_reboot: false,
            force_approval_mode: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub bridge_path: String,
    pub bridge_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
            bridge_path: "/internal/cli/message".into(),
            bridge_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProviderEntry {
    pub api_key: String,
    pub api_base: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openrouter: Option<ProviderEntry>,
    pub anthropic: Option<ProviderEntry>,
    pub openai: Option<ProviderEntry>,
    pub deepseek: Option<ProviderEntry>,
    pub groq: Option<ProviderEntry>,
    pub gemini: Option<ProviderEntry>,
    pub vllm: Option<ProviderEntry>,
}

impl ProvidersConfig {
    /// First configured provider with a non-empty API key, in a fixed
    /// preference order.
    pub fn find_active(&self) -> Option<(&str, &ProviderEntry)> {
        self.find_all_active().into_iter().next()
    }

    pub fn find_all_active(&self) -> Vec<(&str, &ProviderEntry)> {
        let candidates: Vec<(&str, &Option<ProviderEntry>)> = vec![
            ("openrouter", &self.openrouter),
            ("anthropic", &self.anthropic),
            ("openai", &self.openai),
            ("deepseek", &self.deepseek),
            ("groq", &self.groq),
            ("gemini", &self.gemini),
            ("vllm", &self.vllm),
        ];
        candidates
            .into_iter()
            .filter_map(|(name, entry)| entry.as_ref().filter(|e| !e.api_key.is_empty()).map(|e| (name, e)))
            .collect()
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".switchboard")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Resolves a `~/`-prefixed path against the home directory.
    pub fn resolve_path(raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest)
        } else {
            PathBuf::from(raw)
        }
    }

    pub fn workspace_path(&self) -> PathBuf {
        Self::resolve_path(&self.workspace_dir)
    }

    pub fn state_db_path_resolved(&self) -> PathBuf {
        Self::resolve_path(&self.state_db_path)
    }

    pub fn audit_log_path_resolved(&self) -> PathBuf {
        Self::resolve_path(&self.audit_log_path)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write_default_template(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cfg = Config::default();
        std::fs::write(path, serde_json::to_string_pretty(&cfg)?)?;
        Ok(())
    }

    /// Every invalid value is collected rather than failing fast on the
    /// first one, so a misconfigured deployment sees the full picture.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.queue.max_per_chat == 0 {
            errors.push("queue.max_per_chat must be > 0".into());
        }
        if self.queue.max_total < self.queue.max_per_chat {
            errors.push("queue.max_total must be >= queue.max_per_chat".into());
        }
        if self.router.hybrid_alpha != 0.0 && !(0.05..=0.95).contains(&self.router.hybrid_alpha) {
            errors.push("router.hybrid_alpha out of bounds [0.05, 0.95]".into());
        }
        if self.router.min_score_gap < 0.0 || self.router.min_score_gap > 0.5 {
            errors.push("router.min_score_gap must be in [0, 0.5]".into());
        }
        if self.router.ab.split_percent > 100 {
            errors.push("router.ab.split_percent must be <= 100".into());
        }
        if self.router.canary.split_percent > 100 {
            errors.push("router.canary.split_percent must be <= 100".into());
        }
        if self.executor.retry_attempts == 0 {
            errors.push("executor.retry_attempts must be > 0".into());
        }
        if self.gateway.bridge_token.is_empty() {
            errors.push("gateway.bridge_token must be set".into());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.max_per_chat, 30);
        assert_eq!(cfg.queue.max_total, 400);
        assert_eq!(cfg.gateway.port, 18790);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"gateway": {"port": 9000}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.queue.max_per_chat, 30);
    }

    #[test]
    fn test_find_active_provider() {
        let mut providers = ProvidersConfig::default();
        providers.groq = Some(ProviderEntry { api_key: "gk".into(), ..Default::default() });
        let (name, entry) = providers.find_active().unwrap();
        assert_eq!(name, "groq");
        assert_eq!(entry.api_key, "gk");
    }

    #[test]
    fn test_validate_rejects_bad_queue_caps() {
        let mut cfg = Config::default();
        cfg.queue.max_total = 1;
        cfg.queue.max_per_chat = 30;
        cfg.gateway.bridge_token = "t".into();
        let errs = cfg.validate();
        assert!(errs.iter().any(|e| e.contains("max_total")));
    }
}
