//! Hardware platform tags.
//!
//! Tags are compared in canonical form: trimmed, lower-case, and with ESP32
//! variants written dashed (`esp32c3` and `esp32_c3` both become `esp32-c3`).

/// Canonicalise a platform tag. Returns an empty string for blank input.
pub fn normalize_platform(platform: &str) -> String {
    let value = platform.trim().to_ascii_lowercase();

    let Some(rest) = value.strip_prefix("esp32") else {
        return value;
    };
    if rest.is_empty() {
        return value;
    }

    let suffix = rest.strip_prefix(['-', '_']).unwrap_or(rest);
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return value;
    }

    format!("esp32-{suffix}")
}
