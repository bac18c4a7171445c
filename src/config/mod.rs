//! Configuration Module
//!
//! Loads and validates the user configuration (`clawdis.json` /
//! `warelay.json`) and the provider credential sets that live in the
//! environment. File keys are camelCase to match the on-disk format.

pub mod paths;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::providers::ProviderKind;
use crate::utils::normalize_identifier;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub inbound: InboundConfig,

    /// Per-provider overrides. A provider section wins over `inbound` for
    /// the fields it sets.
    #[serde(default, alias = "wa-web")]
    pub wa_web: ProviderSection,
    #[serde(default, alias = "wa-twilio")]
    pub wa_twilio: ProviderSection,
    #[serde(default)]
    pub telegram: ProviderSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    /// Exact-match allow-list of canonical sender identifiers.
    /// `None` means allow all (with a loud warning at relay start);
    /// an empty array means deny all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_from: Option<Vec<String>>,

    #[serde(default)]
    pub reply: ReplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyConfig {
    /// `command` spawns the agent subprocess; `text` expands a static
    /// template without spawning anything.
    #[serde(default)]
    pub mode: ReplyMode,

    /// Agent argv for `command` mode.
    #[serde(default)]
    pub command: Vec<String>,

    /// Reply template for `text` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default)]
    pub session: SessionConfig,

    /// Minutes of silence after which the agent is poked with a heartbeat
    /// prompt. Absent or 0 disables heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_minutes: Option<u64>,

    /// Overrides the generated identity prompt sent to a fresh agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_intro: Option<String>,

    /// Transcribe single voice attachments and append a `Transcript:` block.
    /// Requires `GROQ_API_KEY`.
    #[serde(default)]
    pub transcribe_voice: bool,

    /// Deliver partial replies as the agent streams them instead of waiting
    /// for the full reply.
    #[serde(default)]
    pub stream_replies: bool,

    /// Forward agent tool-activity markers to the peer. Off by default;
    /// they always go to the log.
    #[serde(default)]
    pub forward_tool_events: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            mode: ReplyMode::Command,
            command: Vec::new(),
            text: None,
            session: SessionConfig::default(),
            heartbeat_minutes: None,
            session_intro: None,
            transcribe_voice: false,
            stream_replies: false,
            forward_tool_events: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    #[default]
    Command,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,

    /// Idle expiry in minutes. 0 destroys the session as soon as its reply
    /// completes.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            idle_minutes: default_idle_minutes(),
        }
    }
}

fn default_idle_minutes() -> u64 {
    1440
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    Global,
    #[default]
    PerSender,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_from: Option<Vec<String>>,

    /// Group chats (by chat id) whose traffic is processed without an
    /// operator mention. WhatsApp-Web only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_groups: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from the resolved config file, or defaults when no
    /// file exists yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_file())
    }

    /// Load configuration from a specific path. A missing file yields the
    /// defaults; a malformed file is a hard error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration shape, collecting every problem before
    /// failing. Relay-specific completeness lives in [`validate_for_relay`].
    ///
    /// [`validate_for_relay`]: Self::validate_for_relay
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            issues.push(format!(
                "logging.level: {:?} is not one of {:?}",
                self.logging.level, valid_levels
            ));
        }

        for (kind, section) in [
            (ProviderKind::WaWeb, &self.wa_web),
            (ProviderKind::WaTwilio, &self.wa_twilio),
            (ProviderKind::Telegram, &self.telegram),
        ] {
            if let Some(ref list) = section.allow_from {
                for entry in list {
                    if normalize_identifier(kind, entry).is_err() {
                        issues.push(format!("{kind}.allowFrom: invalid entry {entry:?}"));
                    }
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration problems:\n  - {}", issues.join("\n  - "))
        }
    }

    /// Additional checks the auto-reply path needs: a runnable reply mode.
    pub fn validate_for_relay(&self) -> Result<()> {
        self.validate()?;
        match self.inbound.reply.mode {
            ReplyMode::Command if self.inbound.reply.command.is_empty() => {
                anyhow::bail!("inbound.reply.command is required when mode is \"command\"")
            }
            ReplyMode::Text if self.inbound.reply.text.as_deref().unwrap_or("").is_empty() => {
                anyhow::bail!("inbound.reply.text is required when mode is \"text\"")
            }
            _ => Ok(()),
        }
    }

    /// The effective allow-list for a provider, canonicalised.
    ///
    /// `None` means "allow all" — callers warn once. `Some(vec![])` denies
    /// everything. Entries that fail normalisation were already rejected by
    /// `validate`.
    pub fn allow_list_for(&self, kind: ProviderKind) -> Option<Vec<String>> {
        let section = match kind {
            ProviderKind::WaWeb => &self.wa_web,
            ProviderKind::WaTwilio => &self.wa_twilio,
            ProviderKind::Telegram => &self.telegram,
        };
        let raw = section
            .allow_from
            .as_ref()
            .or(self.inbound.allow_from.as_ref())?;
        Some(
            raw.iter()
                .filter_map(|e| normalize_identifier(kind, e).ok())
                .collect(),
        )
    }

    /// Group chats allow-listed for a provider (canonical chat ids).
    pub fn allowed_groups_for(&self, kind: ProviderKind) -> Vec<String> {
        let section = match kind {
            ProviderKind::WaWeb => &self.wa_web,
            ProviderKind::WaTwilio => &self.wa_twilio,
            ProviderKind::Telegram => &self.telegram,
        };
        section.allow_groups.clone().unwrap_or_default()
    }

    /// Save configuration to a file (pretty-printed JSON).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::info!("configuration saved to {}", path.display());
        Ok(())
    }
}

// ─── Environment credential sets ──────────────────────────────────────────────

/// Twilio credentials: either an auth token or an API key/secret pair,
/// never both.
#[derive(Debug, Clone)]
pub enum TwilioAuth {
    AuthToken(String),
    ApiKey { key: String, secret: String },
}

#[derive(Debug, Clone)]
pub struct TwilioEnv {
    pub account_sid: String,
    pub auth: TwilioAuth,
    /// Sender in `whatsapp:+E164` wire form.
    pub whatsapp_from: Option<String>,
    /// Messaging-service identifier; mutually exclusive with `whatsapp_from`
    /// at send time.
    pub sender_sid: Option<String>,
}

impl TwilioEnv {
    /// Read and cross-check the Twilio variable set. Collects every problem
    /// rather than stopping at the first.
    pub fn from_env() -> std::result::Result<Self, Vec<String>> {
        let mut issues = Vec::new();

        let account_sid = env_nonempty("TWILIO_ACCOUNT_SID");
        if account_sid.is_none() {
            issues.push("TWILIO_ACCOUNT_SID is not set".to_string());
        }

        let auth_token = env_nonempty("TWILIO_AUTH_TOKEN");
        let api_key = env_nonempty("TWILIO_API_KEY");
        let api_secret = env_nonempty("TWILIO_API_SECRET");

        let auth = match (auth_token, api_key, api_secret) {
            (Some(_), Some(_), _) => {
                issues.push(
                    "TWILIO_AUTH_TOKEN and TWILIO_API_KEY are mutually exclusive".to_string(),
                );
                None
            }
            (Some(token), None, _) => Some(TwilioAuth::AuthToken(token)),
            (None, Some(key), Some(secret)) => Some(TwilioAuth::ApiKey { key, secret }),
            (None, Some(_), None) => {
                issues.push("TWILIO_API_KEY is set but TWILIO_API_SECRET is missing".to_string());
                None
            }
            (None, None, Some(_)) => {
                issues.push("TWILIO_API_SECRET is set but TWILIO_API_KEY is missing".to_string());
                None
            }
            (None, None, None) => {
                issues.push(
                    "no Twilio credentials: set TWILIO_AUTH_TOKEN or TWILIO_API_KEY + TWILIO_API_SECRET"
                        .to_string(),
                );
                None
            }
        };

        let whatsapp_from = env_nonempty("TWILIO_WHATSAPP_FROM");
        let sender_sid = env_nonempty("TWILIO_SENDER_SID");
        if whatsapp_from.is_none() && sender_sid.is_none() {
            issues.push(
                "set TWILIO_WHATSAPP_FROM (whatsapp:+E164) or TWILIO_SENDER_SID".to_string(),
            );
        }
        if let Some(ref from) = whatsapp_from {
            if !from.starts_with("whatsapp:+") {
                issues.push(format!(
                    "TWILIO_WHATSAPP_FROM must look like whatsapp:+E164, got {from:?}"
                ));
            }
        }

        match (account_sid, auth) {
            (Some(account_sid), Some(auth)) if issues.is_empty() => Ok(Self {
                account_sid,
                auth,
                whatsapp_from,
                sender_sid,
            }),
            _ => Err(issues),
        }
    }

    /// Whether the variable set looks complete (used by auto-detection).
    pub fn is_configured() -> bool {
        Self::from_env().is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TelegramEnv {
    pub api_id: i32,
    pub api_hash: String,
}

impl TelegramEnv {
    pub fn from_env() -> std::result::Result<Self, Vec<String>> {
        let mut issues = Vec::new();

        let api_id = env_nonempty("TELEGRAM_API_ID");
        let api_hash = env_nonempty("TELEGRAM_API_HASH");

        if api_id.is_some() != api_hash.is_some() {
            issues.push(
                "TELEGRAM_API_ID and TELEGRAM_API_HASH must be set together".to_string(),
            );
        }
        if api_id.is_none() && api_hash.is_none() {
            issues.push("TELEGRAM_API_ID / TELEGRAM_API_HASH are not set".to_string());
        }

        let parsed_id = api_id.as_deref().and_then(|v| v.parse::<i32>().ok());
        if api_id.is_some() && parsed_id.is_none() {
            issues.push("TELEGRAM_API_ID must be a positive integer".to_string());
        }

        match (parsed_id, api_hash) {
            (Some(api_id), Some(api_hash)) if issues.is_empty() => {
                Ok(Self { api_id, api_hash })
            }
            _ => Err(issues),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.inbound.reply.session.idle_minutes, 1440);
        assert_eq!(config.inbound.reply.session.scope, SessionScope::PerSender);
        // The shape is fine, but the relay needs an agent command.
        assert!(config.validate().is_ok());
        assert!(config.validate_for_relay().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "logging": {"level": "debug"},
            "inbound": {
                "allowFrom": ["+15551234567"],
                "reply": {
                    "mode": "command",
                    "command": ["my-agent", "--stdin"],
                    "session": {"scope": "per-sender", "idleMinutes": 60},
                    "heartbeatMinutes": 30
                }
            },
            "telegram": {"allowFrom": ["@Alice"]}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.inbound.reply.heartbeat_minutes, Some(30));
        assert_eq!(config.inbound.reply.session.idle_minutes, 60);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.inbound.reply.command = vec!["agent".into()];
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_text_mode_requires_text() {
        let mut config = Config::default();
        config.inbound.reply.mode = ReplyMode::Text;
        assert!(config.validate_for_relay().is_err());
        config.inbound.reply.text = Some("I am away, back soon.".into());
        config.validate_for_relay().unwrap();
    }

    #[test]
    fn test_allow_list_provider_override_wins() {
        let mut config = Config::default();
        config.inbound.allow_from = Some(vec!["+15550001111".into()]);
        config.telegram.allow_from = Some(vec!["@Alice".into()]);

        let tg = config.allow_list_for(ProviderKind::Telegram).unwrap();
        assert_eq!(tg, vec!["@alice".to_string()]);

        let wa = config.allow_list_for(ProviderKind::WaWeb).unwrap();
        assert_eq!(wa, vec!["+15550001111".to_string()]);
    }

    #[test]
    fn test_absent_allow_list_is_none() {
        let config = Config::default();
        assert!(config.allow_list_for(ProviderKind::WaWeb).is_none());
    }

    #[test]
    fn test_empty_allow_list_denies_all() {
        let mut config = Config::default();
        config.inbound.allow_from = Some(vec![]);
        let list = config.allow_list_for(ProviderKind::WaWeb).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_config_save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clawdis.json");
        let mut config = Config::default();
        config.inbound.reply.command = vec!["agent".into()];
        config.save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.inbound.reply.command, vec!["agent".to_string()]);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let loaded = Config::load_from(Path::new("/nonexistent/clawdis.json")).unwrap();
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let json = r#"{"loging": {"level": "info"}}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }
}
