//! warelay - Personal Messaging Relay
//!
//! Bridges WhatsApp (Web protocol or the Twilio Business API) and Telegram
//! into a local AI agent subprocess: inbound messages from allow-listed
//! senders are fed to the agent, its streamed replies (text and media) are
//! sent back on the provider they arrived on, and idle sessions are poked
//! with periodic heartbeat prompts.
//!
//! ## Quick Start
//!
//! ```bash
//! # Pair WhatsApp Web (QR scan)
//! warelay login --provider wa-web
//!
//! # Run the relay on everything that is configured
//! warelay relay --provider auto
//!
//! # One-off message
//! warelay send --provider telegram --to @alice -m "hello"
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod providers;
pub mod relay;
pub mod reply;
pub mod session;
pub mod utils;

pub use error::{RelayError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
