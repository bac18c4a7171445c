//! Utility modules: identifier normalisation and small string helpers.

use crate::error::{RelayError, Result};
use crate::providers::ProviderKind;

/// Normalise a raw identifier into its canonical routing form for a provider.
///
/// WhatsApp kinds canonicalise to E.164 with a leading `+` and no separators;
/// the `whatsapp:` prefix (Twilio wire form) is stripped. Telegram
/// canonicalises to a lowercased `@username` or a decimal user id; the
/// `telegram:` namespace prefix is stripped. Anything else is rejected.
///
/// Normalisation is idempotent: feeding the output back in returns it
/// unchanged.
pub fn normalize_identifier(kind: ProviderKind, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RelayError::NotFound("empty identifier".into()));
    }

    match kind {
        ProviderKind::WaWeb | ProviderKind::WaTwilio => normalize_phone(trimmed),
        ProviderKind::Telegram => normalize_telegram(trimmed),
    }
}

/// Normalise to E.164: strip `whatsapp:`, drop formatting characters,
/// require digits, prepend `+`.
fn normalize_phone(raw: &str) -> Result<String> {
    let without_scheme = raw.strip_prefix("whatsapp:").unwrap_or(raw);
    let digits: String = without_scheme
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.' | '+'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(RelayError::NotFound(format!(
            "not a phone number: {raw:?}"
        )));
    }

    Ok(format!("+{digits}"))
}

fn normalize_telegram(raw: &str) -> Result<String> {
    let without_ns = raw.strip_prefix("telegram:").unwrap_or(raw);
    let trimmed = without_ns.trim();

    if let Some(username) = trimmed.strip_prefix('@') {
        if username.is_empty() {
            return Err(RelayError::NotFound("empty telegram username".into()));
        }
        return Ok(format!("@{}", username.to_lowercase()));
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        return Ok(trimmed.to_string());
    }
    // Phone numbers are accepted as send targets on Telegram too.
    if trimmed.starts_with('+') {
        return normalize_phone(trimmed);
    }

    Err(RelayError::NotFound(format!(
        "not a telegram identifier: {raw:?}"
    )))
}

/// Extract the E.164 form from a WhatsApp JID, if it carries one.
///
/// `491234@s.whatsapp.net` (with or without a device suffix like `:12`)
/// yields `+491234`. `@lid` and `@g.us` addresses carry no phone number and
/// return `None` — lid senders need the reverse mapping, groups are not
/// phone-addressable.
pub fn jid_to_e164(jid: &str) -> Option<String> {
    let (user, server) = jid.split_once('@')?;
    if server != "s.whatsapp.net" {
        return None;
    }
    let user = user.split(':').next().unwrap_or(user);
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{user}"))
}

/// Render an E.164 number as a personal WhatsApp JID.
pub fn e164_to_jid(e164: &str) -> String {
    format!("{}@s.whatsapp.net", e164.trim_start_matches('+'))
}

/// Whether a JID addresses a group chat.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

/// Whether a JID is a linked-id address (no phone number embedded).
pub fn is_lid_jid(jid: &str) -> bool {
    jid.ends_with("@lid")
}

/// Format a byte count for humans: whole units, B/KB/MB/GB.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB && bytes % GB == 0 {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{} KB", bytes / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Clip a string for log previews. The result is at most `max_bytes` bytes
/// and never splits a multi-byte character: the cut walks characters from
/// the front and stops before the first one that would not fit.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = 0;
    for (offset, c) in s.char_indices() {
        let next = offset + c.len_utf8();
        if next > max_bytes {
            break;
        }
        end = next;
    }
    &s[..end]
}

/// Split a message into chunks that fit a backend's length limit,
/// preferring to break on a nearby newline.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let end = (start + max_len).min(text.len());
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .filter(|&pos| pos > (end - start).saturating_sub(200))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_strips_formatting() {
        let n = normalize_identifier(ProviderKind::WaTwilio, " +1 (555) 123-4567 ").unwrap();
        assert_eq!(n, "+15551234567");
    }

    #[test]
    fn test_normalize_phone_strips_whatsapp_prefix() {
        let n = normalize_identifier(ProviderKind::WaTwilio, "whatsapp:+491234").unwrap();
        assert_eq!(n, "+491234");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_identifier(ProviderKind::WaWeb, "not-a-number").is_err());
        assert!(normalize_identifier(ProviderKind::WaWeb, "").is_err());
    }

    #[test]
    fn test_normalize_telegram_username_lowercases() {
        let n = normalize_identifier(ProviderKind::Telegram, "@Alice").unwrap();
        assert_eq!(n, "@alice");
    }

    #[test]
    fn test_normalize_telegram_strips_namespace() {
        let n = normalize_identifier(ProviderKind::Telegram, "telegram:@Bob").unwrap();
        assert_eq!(n, "@bob");
        let id = normalize_identifier(ProviderKind::Telegram, "telegram:123456").unwrap();
        assert_eq!(id, "123456");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for (kind, raw) in [
            (ProviderKind::WaWeb, "whatsapp:+1 (555) 123-4567"),
            (ProviderKind::Telegram, "telegram:@Carol"),
            (ProviderKind::Telegram, "987654"),
        ] {
            let once = normalize_identifier(kind, raw).unwrap();
            let twice = normalize_identifier(kind, &once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_jid_round_trip() {
        let jid = e164_to_jid("+15551234567");
        assert_eq!(jid, "15551234567@s.whatsapp.net");
        assert_eq!(jid_to_e164(&jid), Some("+15551234567".to_string()));
    }

    #[test]
    fn test_jid_device_suffix_ignored() {
        assert_eq!(
            jid_to_e164("15551234567:12@s.whatsapp.net"),
            Some("+15551234567".to_string())
        );
    }

    #[test]
    fn test_jid_lid_and_group_yield_none() {
        assert_eq!(jid_to_e164("123456789@lid"), None);
        assert_eq!(jid_to_e164("12345-678@g.us"), None);
        assert!(is_lid_jid("123456789@lid"));
        assert!(is_group_jid("12345-678@g.us"));
        assert!(!is_group_jid("123@s.whatsapp.net"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(5 * 1024), "5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2 GB");
    }

    #[test]
    fn test_truncate_str_short_input_untouched() {
        assert_eq!(truncate_str("ping", 50), "ping");
        assert_eq!(truncate_str("", 0), "");
    }

    #[test]
    fn test_truncate_str_never_splits_characters() {
        // "grüße": ü and ß are two bytes each, seven bytes total.
        let s = "grüße";
        assert_eq!(truncate_str(s, 7), "grüße");
        assert_eq!(truncate_str(s, 6), "grüß");
        assert_eq!(truncate_str(s, 5), "grü");
        assert_eq!(truncate_str(s, 3), "gr");
        assert_eq!(truncate_str(s, 0), "");
    }

    #[test]
    fn test_truncate_str_cjk_preview() {
        // Three-byte characters: a 50-byte log preview of a Japanese
        // message must end on a whole character.
        let s = "日本語のメッセージ";
        let clipped = truncate_str(s, 7);
        assert_eq!(clipped, "日本");
        assert!(s.starts_with(clipped));
    }

    #[test]
    fn test_split_message_reassembles() {
        let text = "a\n".repeat(3000);
        let chunks = split_message(&text, 4096);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 4096);
        }
        let joined: String = chunks.into_iter().collect();
        assert_eq!(joined, text);
    }
}
