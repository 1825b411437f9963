pub const MODEL_GEMINI_3_PRO_PREVIEW: &str = "gemini-3-pro-preview";
pub const MODEL_GEMINI_FLASH_EXP: &str = "gemini-2.0-flash-exp";
pub const MODEL_GEMINI_FLASH_THINKING: &str = "gemini-2.5-flash-thinking";

// Shown by /v1/models when no account carries its own model list.
pub const DEFAULT_MODELS: &[&str] = &[
    MODEL_GEMINI_3_PRO_PREVIEW,
    MODEL_GEMINI_FLASH_EXP,
    MODEL_GEMINI_FLASH_THINKING,
];

/// Map a requested model onto the upstream model the cloud endpoint serves.
/// Substring matches are case-insensitive; unknown names pass through.
pub fn map_to_upstream_model(requested: &str) -> String {
    let lower = requested.to_ascii_lowercase();
    if lower.contains("sonnet") || lower.contains("thinking") || lower.contains("opus") {
        MODEL_GEMINI_3_PRO_PREVIEW.to_string()
    } else if lower.contains("haiku") {
        MODEL_GEMINI_FLASH_EXP.to_string()
    } else if lower.contains("claude") {
        MODEL_GEMINI_FLASH_THINKING.to_string()
    } else {
        requested.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_family_maps_by_tier() {
        assert_eq!(map_to_upstream_model("claude-sonnet-4-5"), MODEL_GEMINI_3_PRO_PREVIEW);
        assert_eq!(map_to_upstream_model("claude-opus-4-5"), MODEL_GEMINI_3_PRO_PREVIEW);
        assert_eq!(
            map_to_upstream_model("claude-haiku-4-5"),
            MODEL_GEMINI_FLASH_EXP
        );
        // Generic claude names fall through to the thinking flash model.
        assert_eq!(map_to_upstream_model("claude-2"), MODEL_GEMINI_FLASH_THINKING);
    }

    #[test]
    fn thinking_variants_route_to_pro() {
        assert_eq!(
            map_to_upstream_model("gemini-2.5-flash-THINKING"),
            MODEL_GEMINI_3_PRO_PREVIEW
        );
    }

    #[test]
    fn unknown_models_pass_through() {
        assert_eq!(map_to_upstream_model("gpt-4"), "gpt-4");
        assert_eq!(map_to_upstream_model("gemini-3-pro-preview"), "gemini-3-pro-preview");
    }
}
