use regex::Regex;
use std::sync::OnceLock;

/// Shown in place of an utterance that was nothing but noise markers.
const PLACEHOLDER: &str = "…";

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s*\[[^\]]*\]\s*").unwrap())
}

/// Strip bracket-delimited noise markers ("[typing]", "[background noise]",
/// "[cough]") from a transcript line and collapse the remaining whitespace.
/// A line that was nothing but markers comes back as an ellipsis so the UI
/// never renders a blank utterance; blank input stays blank.
pub fn sanitize(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let cleaned = marker_pattern().replace_all(text, " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        cleaned
    }
}
