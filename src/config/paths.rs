//! Config and temp directory resolution.
//!
//! The relay keeps all of its on-disk state under one per-user directory.
//! Resolution order: `$WARELAY_CONFIG_DIR` if writable, then `~/.clawdis`
//! (the preferred brand dir), then `~/.warelay` (legacy), then `./clawdis`,
//! then an OS-temp subdirectory. The first writable candidate wins and the
//! choice is cached for the life of the process.

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

static CONFIG_DIR: OnceCell<PathBuf> = OnceCell::new();

const ENV_CONFIG_DIR: &str = "WARELAY_CONFIG_DIR";
const PREFERRED_DIR: &str = ".clawdis";
const LEGACY_DIR: &str = ".warelay";
const CWD_FALLBACK: &str = "clawdis";

/// Resolve (and cache) the per-user config directory.
pub fn config_dir() -> PathBuf {
    CONFIG_DIR
        .get_or_init(|| {
            for candidate in candidates() {
                if ensure_writable(&candidate) {
                    tracing::debug!("config dir: {}", candidate.display());
                    return candidate;
                }
            }
            // Last resort — std::env::temp_dir always exists.
            let tmp = std::env::temp_dir().join(CWD_FALLBACK);
            let _ = std::fs::create_dir_all(&tmp);
            tracing::warn!("no writable config dir candidate, using {}", tmp.display());
            tmp
        })
        .clone()
}

fn candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        if !dir.trim().is_empty() {
            out.push(PathBuf::from(dir));
        }
    }
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(PREFERRED_DIR));
        out.push(home.join(LEGACY_DIR));
    }
    out.push(PathBuf::from(".").join(CWD_FALLBACK));
    out
}

/// Create the directory if needed and probe it with a write.
fn ensure_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".write-probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Path of the user configuration file. `clawdis.json` is preferred; an
/// existing `warelay.json` is honoured for older installs.
pub fn config_file() -> PathBuf {
    let dir = config_dir();
    let preferred = dir.join("clawdis.json");
    if preferred.exists() {
        return preferred;
    }
    let legacy = dir.join("warelay.json");
    if legacy.exists() {
        return legacy;
    }
    preferred
}

/// WhatsApp-Web credential store directory.
pub fn credentials_dir() -> PathBuf {
    config_dir().join("credentials")
}

/// Telegram session token file.
pub fn telegram_session_file() -> PathBuf {
    config_dir().join("telegram").join("session").join("session.string")
}

/// Older installs kept the Telegram token directly under the config root.
pub fn telegram_legacy_session_file() -> PathBuf {
    config_dir().join("telegram.session")
}

/// Directory for streaming-download temp files. `$TELEGRAM_TEMP_DIR`
/// overrides; otherwise a sibling of the session state.
pub fn telegram_temp_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TELEGRAM_TEMP_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    config_dir().join("telegram-temp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_writable_creates_and_probes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("deep");
        assert!(ensure_writable(&dir));
        assert!(dir.is_dir());
        assert!(!dir.join(".write-probe").exists());
    }

    #[test]
    fn test_candidates_include_cwd_fallback() {
        let c = candidates();
        assert!(c.iter().any(|p| p.ends_with(CWD_FALLBACK)));
    }
}
