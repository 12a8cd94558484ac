//! Text normalization and language detection helpers.

use serde::{Deserialize, Serialize};

const THAI_BLOCK_START: char = '\u{0E00}';
const THAI_BLOCK_END: char = '\u{0E7F}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Th,
    En,
}

/// Any Thai codepoint makes the whole message Thai; mixed-script queries from
/// Thai users usually embed English place names, not the other way around.
/// Empty input defaults to Thai, the deployment's primary audience.
pub fn detect_language(text: &str) -> Language {
    if text.is_empty() {
        return Language::Th;
    }
    if text.chars().any(|c| (THAI_BLOCK_START..=THAI_BLOCK_END).contains(&c)) {
        Language::Th
    } else {
        Language::En
    }
}

/// Trim, lowercase, and collapse runs of whitespace to a single space.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        for lower in c.to_lowercase() {
            out.push(lower);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thai_characters_win() {
        assert_eq!(detect_language("วัดบางกุ้ง"), Language::Th);
        assert_eq!(detect_language("ไป amphawa ยังไง"), Language::Th);
        assert_eq!(detect_language("floating market"), Language::En);
        assert_eq!(detect_language(""), Language::Th);
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  Amphawa   Floating\tMarket "), "amphawa floating market");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }
}
