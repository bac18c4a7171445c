//! CLI Module
//!
//! Command-line interface using Clap v4: `login`, `logout`, `send`,
//! `status`, `relay`, and `heartbeat`, with provider selection flags and
//! relay tuning. Exit codes: 0 on success, 1 on configuration or fatal
//! runtime errors.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::config::{paths, Config, TelegramEnv, TwilioEnv};
use crate::providers::{
    connect_provider, create_provider, ListenTuning, MediaAttachment, MediaContent, MediaKind,
    ProviderKind, ReconnectPolicy, SendOptions,
};
use crate::relay::ProviderSelection;

/// warelay — relay WhatsApp and Telegram messages to a local AI agent
#[derive(Parser, Debug)]
#[command(name = "warelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Configuration file path (default: <config dir>/clawdis.json)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ProviderFlags {
    /// Single provider (wa-web, wa-twilio, telegram, or auto)
    #[arg(long)]
    pub provider: Option<String>,

    /// Comma-separated list of providers
    #[arg(long, conflicts_with = "provider")]
    pub providers: Option<String>,
}

impl ProviderFlags {
    /// Resolve the flags into a selection. No flags means auto-detect.
    pub fn selection(&self) -> Result<ProviderSelection> {
        if let Some(ref csv) = self.providers {
            let kinds = csv
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse::<ProviderKind>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if kinds.is_empty() {
                anyhow::bail!("--providers was given but names no provider");
            }
            return Ok(ProviderSelection::Explicit(kinds));
        }
        match self.provider.as_deref() {
            None | Some("auto") => Ok(ProviderSelection::Auto),
            Some(name) => Ok(ProviderSelection::Explicit(vec![name.parse()?])),
        }
    }

    /// A single concrete provider, auto-detecting when unspecified.
    pub fn single(&self) -> Result<ProviderKind> {
        match self.selection()? {
            ProviderSelection::Explicit(kinds) if kinds.len() == 1 => Ok(kinds[0]),
            ProviderSelection::Explicit(_) => {
                anyhow::bail!("this command takes exactly one provider")
            }
            ProviderSelection::Auto => crate::relay::detect_configured()
                .first()
                .copied()
                .context("no provider configured — pass --provider"),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate a provider (QR scan, phone+code, or credential check)
    Login {
        #[command(flatten)]
        provider: ProviderFlags,
    },

    /// Revoke a provider's session and erase local state
    Logout {
        #[command(flatten)]
        provider: ProviderFlags,
    },

    /// Send a single message
    Send {
        #[command(flatten)]
        provider: ProviderFlags,

        /// Recipient: +E164, @username, user id, or JID
        #[arg(long)]
        to: String,

        /// Message body
        #[arg(long, short)]
        message: String,

        /// Attach media by URL or local path
        #[arg(long)]
        media: Option<String>,

        /// Show a typing indicator before the message
        #[arg(long)]
        typing: bool,
    },

    /// Show configuration and per-provider authentication state
    Status,

    /// Run the relay: listen on providers and auto-reply via the agent
    Relay {
        #[command(flatten)]
        provider: ProviderFlags,

        /// Twilio poll interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Twilio lookback window in seconds
        #[arg(long, default_value_t = 600)]
        lookback: u64,

        /// WhatsApp-Web keepalive ping interval in seconds
        #[arg(long)]
        web_heartbeat: Option<u64>,

        /// Reconnect: initial backoff in milliseconds
        #[arg(long, default_value_t = 2000)]
        reconnect_initial_ms: u64,

        /// Reconnect: backoff ceiling in milliseconds
        #[arg(long, default_value_t = 60_000)]
        reconnect_max_ms: u64,

        /// Reconnect: backoff multiplier
        #[arg(long, default_value_t = 2.0)]
        reconnect_factor: f64,

        /// Reconnect: jitter fraction (0 disables)
        #[arg(long, default_value_t = 0.2)]
        reconnect_jitter: f64,

        /// Reconnect: attempts before giving up
        #[arg(long, default_value_t = 10)]
        reconnect_attempts: u32,
    },

    /// Poke the agent once with the heartbeat prompt and print its reply
    Heartbeat,
}

/// Main CLI entry point.
pub async fn run(cli: Cli) -> Result<()> {
    let config = match cli.config {
        Some(ref path) => Config::load_from(std::path::Path::new(path))?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Login { provider } => cmd_login(&config, &provider).await,
        Commands::Logout { provider } => cmd_logout(&config, &provider).await,
        Commands::Send {
            provider,
            to,
            message,
            media,
            typing,
        } => cmd_send(&config, &provider, &to, &message, media, typing).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Relay {
            provider,
            interval,
            lookback,
            web_heartbeat,
            reconnect_initial_ms,
            reconnect_max_ms,
            reconnect_factor,
            reconnect_jitter,
            reconnect_attempts,
        } => {
            config
                .validate_for_relay()
                .context("the relay needs a valid configuration")?;
            let tuning = ListenTuning {
                poll_interval: Duration::from_secs(interval.max(1)),
                lookback: Duration::from_secs(lookback.max(1)),
                reconnect: ReconnectPolicy {
                    initial: Duration::from_millis(reconnect_initial_ms),
                    max: Duration::from_millis(reconnect_max_ms),
                    factor: reconnect_factor,
                    jitter: reconnect_jitter,
                    max_attempts: reconnect_attempts,
                },
                web_heartbeat: web_heartbeat.map(Duration::from_secs),
                fatal: None,
            };
            crate::relay::run(config, provider.selection()?, tuning).await
        }
        Commands::Heartbeat => cmd_heartbeat(&config).await,
    }
}

async fn cmd_login(config: &Config, flags: &ProviderFlags) -> Result<()> {
    let kind = flags.single()?;
    let provider = create_provider(kind, config)?;
    provider.initialize().await?;
    provider.login().await?;
    println!("✔ {} login complete", kind.detailed_name());
    Ok(())
}

async fn cmd_logout(config: &Config, flags: &ProviderFlags) -> Result<()> {
    let kind = flags.single()?;
    let provider = create_provider(kind, config)?;
    provider.logout().await?;
    println!("✔ {} logged out", kind.detailed_name());
    Ok(())
}

async fn cmd_send(
    config: &Config,
    flags: &ProviderFlags,
    to: &str,
    message: &str,
    media: Option<String>,
    typing: bool,
) -> Result<()> {
    let kind = flags.single()?;
    let provider = connect_provider(kind, config).await?;

    let media = media
        .map(|value| {
            let content = if value.starts_with("http://") || value.starts_with("https://") {
                MediaContent::Url(value)
            } else {
                MediaContent::Path(value.into())
            };
            MediaAttachment::new(MediaKind::Document, content)
        })
        .into_iter()
        .collect();

    let result = provider
        .send(
            to,
            message,
            SendOptions {
                media,
                reply_to: None,
                typing,
            },
        )
        .await?;

    let _ = provider.disconnect().await;

    if result.is_failed() {
        anyhow::bail!(
            "send failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    println!(
        "✔ sent via {} (id: {})",
        kind.detailed_name(),
        result.message_id
    );
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("warelay status\n");
    println!("Config dir:  {}", paths::config_dir().display());
    println!("Config file: {}", paths::config_file().display());
    println!(
        "Reply mode:  {:?} (scope {:?}, idle {} min)",
        config.inbound.reply.mode,
        config.inbound.reply.session.scope,
        config.inbound.reply.session.idle_minutes,
    );
    if config.inbound.allow_from.is_none() {
        println!("⚠ inbound.allowFrom is not set — every sender is accepted");
    }
    println!();

    for kind in ProviderKind::ALL {
        println!("{}", kind.detailed_name());
        match kind {
            ProviderKind::WaWeb => {
                let paired = crate::providers::waweb::WaWebProvider::credentials_present();
                println!("  paired:      {}", if paired { "yes" } else { "no" });
            }
            ProviderKind::WaTwilio => match TwilioEnv::from_env() {
                Ok(env) => {
                    println!("  environment: complete (account {})", env.account_sid);
                    if let Ok(provider) = create_provider(kind, config) {
                        let authed = provider.is_authenticated().await;
                        println!(
                            "  credentials: {}",
                            if authed { "verified" } else { "rejected" }
                        );
                    }
                }
                Err(issues) => {
                    for issue in issues {
                        println!("  environment: ✖ {issue}");
                    }
                }
            },
            ProviderKind::Telegram => {
                match TelegramEnv::from_env() {
                    Ok(_) => println!("  environment: complete"),
                    Err(issues) => {
                        for issue in issues {
                            println!("  environment: ✖ {issue}");
                        }
                    }
                }
                let session = crate::providers::telegram::TelegramProvider::session_present();
                println!(
                    "  session:     {}",
                    if session { "stored" } else { "absent" }
                );
            }
        }
        let caps = crate::providers::ProviderCapabilities::for_kind(kind);
        println!(
            "  media limit: {}, typing: {}",
            crate::utils::format_bytes(caps.max_media_size),
            if caps.typing_indicator { "yes" } else { "no" },
        );
        if let Some(list) = config.allow_list_for(kind) {
            println!(
                "  allow-list:  {} entr{}",
                list.len(),
                if list.len() == 1 { "y" } else { "ies" }
            );
        }
        println!();
    }

    let configured = crate::relay::detect_configured();
    if configured.is_empty() {
        println!("No provider is ready for `warelay relay`.");
    } else {
        println!(
            "Ready for relay: {}",
            configured
                .iter()
                .map(|k| k.tag())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

/// Poke the agent once with the heartbeat prompt, without any provider.
async fn cmd_heartbeat(config: &Config) -> Result<()> {
    use crate::reply::agent::AgentProcess;
    use crate::reply::identity::HEARTBEAT_OK;

    config.validate_for_relay()?;
    if config.inbound.reply.command.is_empty() {
        anyhow::bail!("heartbeat needs inbound.reply.command (text mode has no agent to poke)");
    }

    let agent = AgentProcess::spawn(&config.inbound.reply.command, "").await?;
    agent.send_prompt(crate::reply::HEARTBEAT_PROMPT).await?;
    let reply = agent.read_reply(None).await?;
    agent.kill().await;

    if reply.body == HEARTBEAT_OK {
        println!("(agent reports nothing new)");
    } else {
        println!("{}", reply.body);
        for path in reply.media {
            println!("MEDIA: {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_provider_flags_single() {
        let flags = ProviderFlags {
            provider: Some("telegram".into()),
            providers: None,
        };
        assert_eq!(flags.single().unwrap(), ProviderKind::Telegram);
    }

    #[test]
    fn test_provider_flags_csv() {
        let flags = ProviderFlags {
            provider: None,
            providers: Some("wa-web, telegram".into()),
        };
        match flags.selection().unwrap() {
            ProviderSelection::Explicit(kinds) => {
                assert_eq!(kinds, vec![ProviderKind::WaWeb, ProviderKind::Telegram]);
            }
            ProviderSelection::Auto => panic!("expected explicit"),
        }
    }

    #[test]
    fn test_provider_flags_auto() {
        let flags = ProviderFlags {
            provider: Some("auto".into()),
            providers: None,
        };
        assert!(matches!(
            flags.selection().unwrap(),
            ProviderSelection::Auto
        ));
    }

    #[test]
    fn test_provider_flags_legacy_alias() {
        let flags = ProviderFlags {
            provider: Some("twilio".into()),
            providers: None,
        };
        assert_eq!(flags.single().unwrap(), ProviderKind::WaTwilio);
    }

    #[test]
    fn test_provider_flags_unknown_fails() {
        let flags = ProviderFlags {
            provider: Some("signal".into()),
            providers: None,
        };
        assert!(flags.selection().is_err());
    }
}
