use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Default WAF evaluation budget handed to the engine, in milliseconds.
pub const DEFAULT_WAF_TIMEOUT_MS: u64 = 20;

/// Engine-side evaluation cap in microseconds, used when a caller passes no
/// explicit budget.
pub const ENGINE_RUN_TIMEOUT_US: u64 = 5000;

/// Default number of security events recorded per time window.
pub const DEFAULT_TRACE_RATE_LIMIT: u32 = 100;

/// Default remote configuration poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: f64 = 5.0;

/// Default obfuscation regex applied to parameter keys before reporting.
pub const DEFAULT_OBFUSCATION_KEY_REGEXP: &str = r"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?)key)|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)|bearer|authorization";

/// Default obfuscation regex applied to parameter values before reporting.
pub const DEFAULT_OBFUSCATION_VALUE_REGEXP: &str = r#"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?|access_?|secret_?)key(?:_?id)?|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)?|auth(?:entication|orization)?)(?:\s*=[^;]|"\s*:\s*"[^"]+")|bearer\s+[a-z0-9\._\-]+|token:[a-z0-9]{13}|gh[opsu]_[0-9a-zA-Z]{36}|ey[I-L][\w=-]+\.ey[I-L][\w=-]+(?:\.[\w.+\/=-]+)?|[\-]{5}BEGIN[a-z\s]+PRIVATE\sKEY[\-]{5}[^\-]+[\-]{5}END[a-z\s]+PRIVATE\sKEY|ssh-rsa\s*[a-z0-9\/\.+]{100,}"#;

/// Main configuration for the application security agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSecConfig {
    /// Master switch for request-path security evaluation
    pub enabled: bool,
    /// WAF engine settings
    pub waf: WafConfig,
    /// Remote configuration client settings
    pub remote_config: RemoteConfigSettings,
    /// Serverless mini-agent settings
    pub serverless: ServerlessConfig,
}

/// WAF engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    /// Path to the ruleset JSON file; the embedded default ruleset is used
    /// when unset
    pub rules_path: Option<String>,
    /// Per-evaluation budget in milliseconds
    pub timeout_ms: u64,
    /// Security events recorded per window before suppression kicks in
    pub trace_rate_limit: u32,
    /// Regex matched against parameter keys to redact reported values
    pub obfuscation_parameter_key_regexp: String,
    /// Regex matched against parameter values to redact reported values
    pub obfuscation_parameter_value_regexp: String,
}

/// Remote configuration client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfigSettings {
    /// Enable the background poller
    pub enabled: bool,
    /// Agent base URL
    pub agent_url: String,
    /// Poll interval in seconds
    pub poll_interval_seconds: f64,
    /// Bounded wait for the in-flight cycle on disable, in seconds
    pub shutdown_timeout_seconds: u64,
    /// Service name reported in the client payload
    pub service: Option<String>,
    /// Environment name reported in the client payload
    pub env: Option<String>,
    /// Application version reported in the client payload
    pub app_version: Option<String>,
}

/// Serverless mini-agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerlessConfig {
    /// Path to the mini-agent binary; a platform default is derived when
    /// unset
    pub mini_agent_path: Option<String>,
}

impl Default for AppSecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            waf: WafConfig {
                rules_path: None,
                timeout_ms: DEFAULT_WAF_TIMEOUT_MS,
                trace_rate_limit: DEFAULT_TRACE_RATE_LIMIT,
                obfuscation_parameter_key_regexp: DEFAULT_OBFUSCATION_KEY_REGEXP.to_string(),
                obfuscation_parameter_value_regexp: DEFAULT_OBFUSCATION_VALUE_REGEXP.to_string(),
            },
            remote_config: RemoteConfigSettings {
                enabled: true,
                agent_url: "http://localhost:8126".to_string(),
                poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
                shutdown_timeout_seconds: 5,
                service: None,
                env: None,
                app_version: None,
            },
            serverless: ServerlessConfig {
                mini_agent_path: None,
            },
        }
    }
}

impl AppSecConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APPSEC"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Apply environment variable overrides on top of the current values
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("APPSEC_ENABLED") {
            self.enabled = parse_bool(&enabled, self.enabled);
        }

        if let Ok(rules) = std::env::var("APPSEC_RULES") {
            if !rules.is_empty() {
                self.waf.rules_path = Some(rules);
            }
        }

        if let Ok(timeout) = std::env::var("APPSEC_WAF_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.waf.timeout_ms = ms;
            }
        }

        if let Ok(limit) = std::env::var("APPSEC_TRACE_RATE_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.waf.trace_rate_limit = n;
            }
        }

        if let Ok(re) = std::env::var("APPSEC_OBFUSCATION_PARAMETER_KEY_REGEXP") {
            self.waf.obfuscation_parameter_key_regexp = re;
        }

        if let Ok(re) = std::env::var("APPSEC_OBFUSCATION_PARAMETER_VALUE_REGEXP") {
            self.waf.obfuscation_parameter_value_regexp = re;
        }

        if let Ok(enabled) = std::env::var("APPSEC_REMOTE_CONFIGURATION_ENABLED") {
            self.remote_config.enabled = parse_bool(&enabled, self.remote_config.enabled);
        }

        if let Ok(interval) = std::env::var("APPSEC_REMOTE_CONFIG_POLL_INTERVAL_SECONDS") {
            if let Ok(secs) = interval.parse() {
                self.remote_config.poll_interval_seconds = secs;
            }
        }

        if let Ok(url) = std::env::var("APPSEC_AGENT_URL") {
            self.remote_config.agent_url = url;
        }

        if let Ok(path) = std::env::var("APPSEC_MINI_AGENT_PATH") {
            self.serverless.mini_agent_path = Some(path);
        }

        info!("Applied environment variable overrides");
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.waf.timeout_ms == 0 {
            return Err("WAF timeout cannot be 0".to_string());
        }

        if self.waf.trace_rate_limit == 0 {
            return Err("Trace rate limit cannot be 0".to_string());
        }

        if self.remote_config.enabled {
            if self.remote_config.agent_url.is_empty() {
                return Err("Agent URL cannot be empty when remote config is enabled".to_string());
            }
            if self.remote_config.poll_interval_seconds <= 0.0 {
                return Err("Poll interval must be positive".to_string());
            }
        }

        Ok(())
    }

    /// Get the WAF evaluation budget as a Duration
    pub fn waf_timeout(&self) -> Duration {
        Duration::from_millis(self.waf.timeout_ms)
    }
}

impl RemoteConfigSettings {
    /// Get the poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds.max(0.001))
    }

    /// Get the poller shutdown budget as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
