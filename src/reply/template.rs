//! Template expansion for reply text and agent prompts.
//!
//! `{{Name}}` placeholders (whitespace inside the braces is tolerated) are
//! replaced with values from a string context map. Unknown placeholders and
//! missing keys both expand to the empty string; literal text is left
//! untouched.

use std::collections::HashMap;

/// Context map handed to [`expand`]. Callers fill in the keys they know;
/// recognised names include `Body`, `BodyStripped`, `From`, `To`,
/// `MessageSid`, `MediaPath`, `MediaUrl`, `MediaType`, `Transcript`,
/// `ChatType`, `GroupSubject`, `GroupMembers`, `SenderName`, `SenderE164`,
/// `SessionId`, `IsNewSession`, `PROVIDERS`.
pub type TemplateContext = HashMap<String, String>;

pub fn expand(template: &str, context: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                if let Some(value) = context.get(name) {
                    out.push_str(value);
                }
                // Unknown or missing: expand to nothing.
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated braces are literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Convenience for building a context from pairs.
pub fn context_from<const N: usize>(pairs: [(&str, String); N]) -> TemplateContext {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_known_placeholder() {
        let ctx = context_from([("From", "+15551234567".to_string())]);
        assert_eq!(expand("msg from {{From}}", &ctx), "msg from +15551234567");
    }

    #[test]
    fn test_expand_tolerates_whitespace() {
        let ctx = context_from([("Body", "hi".to_string())]);
        assert_eq!(expand("{{ Body }}!", &ctx), "hi!");
        assert_eq!(expand("{{  Body}}", &ctx), "hi");
    }

    #[test]
    fn test_unknown_and_missing_expand_to_empty() {
        let ctx = TemplateContext::new();
        assert_eq!(expand("a{{Nope}}b", &ctx), "ab");
        let ctx = context_from([("Body", "x".to_string())]);
        assert_eq!(expand("a{{Transcript}}b", &ctx), "ab");
    }

    #[test]
    fn test_literal_text_unchanged_with_empty_context() {
        let ctx = TemplateContext::new();
        assert_eq!(expand("no placeholders here", &ctx), "no placeholders here");
        assert_eq!(expand("half open {{ not closed", &ctx), "half open {{ not closed");
        assert_eq!(expand("}} stray close", &ctx), "}} stray close");
    }

    #[test]
    fn test_multiple_placeholders() {
        let ctx = context_from([
            ("From", "@alice".to_string()),
            ("Body", "ping".to_string()),
        ]);
        assert_eq!(expand("{{From}}: {{Body}} {{From}}", &ctx), "@alice: ping @alice");
    }
}
