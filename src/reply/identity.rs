//! Provider-aware identity prompt for fresh agent sessions.

use crate::providers::{ProviderCapabilities, ProviderKind};
use crate::utils::format_bytes;
use std::path::Path;

/// Marker the agent uses to attach a file to its reply.
pub const MEDIA_MARKER: &str = "MEDIA:";

/// Reply body an agent returns when a heartbeat found nothing to say.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Marker line that ends one streamed reply in the agent protocol.
pub const END_MARKER: &str = "EOM";

/// Build the identity prompt for a new session, unless the operator supplied
/// their own `sessionIntro` (which is used verbatim after template
/// expansion).
pub fn build_identity(
    kind: ProviderKind,
    caps: &ProviderCapabilities,
    scratch_dir: &Path,
    active: &[ProviderKind],
) -> String {
    let providers = detailed_provider_list(active);
    format!(
        "You are replying on {messenger} on behalf of the account owner.\n\
         Active providers: {providers}.\n\
         Keep replies concise and conversational; they are delivered as chat messages.\n\
         Media: to attach a file, print a line containing only `{media}<absolute path>`.\n\
         The current provider accepts media up to {limit}.\n\
         Scratch directory for generated files: {scratch}\n\
         End every reply with a line containing only `{end}`.\n\
         Heartbeats: you will occasionally receive an automated check-in prompt. \
         If there is nothing worth telling the owner, reply with exactly `{ok}`.",
        messenger = kind.messenger_name(),
        providers = providers,
        media = MEDIA_MARKER,
        limit = format_bytes(caps.max_media_size),
        scratch = scratch_dir.display(),
        end = END_MARKER,
        ok = HEARTBEAT_OK,
    )
}

/// Comma-separated detailed names for the `{{PROVIDERS}}` placeholder.
pub fn detailed_provider_list(active: &[ProviderKind]) -> String {
    active
        .iter()
        .map(|k| k.detailed_name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderCapabilities;

    #[test]
    fn test_identity_names_messenger_and_limit() {
        let caps = ProviderCapabilities::for_kind(ProviderKind::WaTwilio);
        let prompt = build_identity(
            ProviderKind::WaTwilio,
            &caps,
            Path::new("/tmp/scratch"),
            &[ProviderKind::WaTwilio],
        );
        assert!(prompt.contains("WhatsApp"));
        assert!(prompt.contains("5 MB"));
        assert!(prompt.contains("/tmp/scratch"));
        assert!(prompt.contains("MEDIA:"));
        assert!(prompt.contains("HEARTBEAT_OK"));
    }

    #[test]
    fn test_detailed_provider_list() {
        let list = detailed_provider_list(&[
            ProviderKind::WaWeb,
            ProviderKind::WaTwilio,
            ProviderKind::Telegram,
        ]);
        assert_eq!(list, "WhatsApp Web, WhatsApp (Twilio), Telegram");
    }
}
