//! Prompt construction for the staging model.
//!
//! The template is fixed; the same hints always produce the same prompt so a
//! seeded generation is reproducible end to end.

pub const DEFAULT_ROOM_TYPE: &str = "living room";
pub const DEFAULT_STYLE: &str = "modern";

const NEGATIVE_PROMPT: &str = "blurry, distorted perspective, warped walls, extra windows, \
people, text, watermark, low quality, cartoon";

/// Prompt pair sent to the inference API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPrompt {
    pub prompt: String,
    pub negative_prompt: String,
}

/// Build the staging prompt from the optional room type / style hints.
///
/// Hints are normalised (trimmed, lower-cased, `_`/`-` read as spaces); blank
/// hints fall back to [`DEFAULT_ROOM_TYPE`] / [`DEFAULT_STYLE`].
pub fn build_prompt(room_type: Option<&str>, style: Option<&str>) -> StagingPrompt {
    let room = normalize_hint(room_type).unwrap_or_else(|| DEFAULT_ROOM_TYPE.to_string());
    let style = normalize_hint(style).unwrap_or_else(|| DEFAULT_STYLE.to_string());

    StagingPrompt {
        prompt: format!(
            "a {style} style {room}, professionally staged with tasteful furniture and decor, \
             keep the original walls, windows and floor, realistic natural lighting, \
             high resolution real estate photography"
        ),
        negative_prompt: NEGATIVE_PROMPT.to_string(),
    }
}

fn normalize_hint(hint: Option<&str>) -> Option<String> {
    let cleaned = hint?
        .trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() { None } else { Some(cleaned) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_defaults_for_missing_or_blank_hints() {
        let p = build_prompt(None, Some("   "));
        assert!(p.prompt.starts_with("a modern style living room,"));
    }

    #[test]
    fn normalizes_hints() {
        let p = build_prompt(Some("  Master_Bedroom "), Some("Mid-Century"));
        assert!(p.prompt.starts_with("a mid century style master bedroom,"));
    }

    #[test]
    fn is_deterministic() {
        assert_eq!(
            build_prompt(Some("kitchen"), Some("scandinavian")),
            build_prompt(Some("kitchen"), Some("scandinavian"))
        );
    }
}
