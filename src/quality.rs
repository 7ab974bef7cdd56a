//! Quality-range constants and PNG-capability sniffing.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/quality.cpp`.

pub const MIN_QUALITY: u32 = 10;
pub const MAX_QUALITY: u32 = 101;

/// Windows 3.1-era / 16-bit clients cannot decode PNG; their user agents
/// are sniffed for a handful of substrings, matching the source exactly.
pub fn has_png_support(user_agent: &str) -> bool {
    let lower = user_agent.to_lowercase();
    !lower.contains("windows 3.1") && !lower.contains("win16") && !lower.contains("windows 16-bit")
}

/// The highest selectable quality for a client, depending on whether it can
/// decode PNG.
pub fn max_quality(allow_png: bool) -> u32 {
    if allow_png {
        MAX_QUALITY
    } else {
        MAX_QUALITY - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_legacy_user_agents() {
        assert!(!has_png_support("Mozilla/2.0 (compatible; Windows 3.1)"));
        assert!(!has_png_support("Some-Client/1.0 Win16"));
        assert!(!has_png_support("Weird Windows 16-bit Browser"));
        assert!(has_png_support("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"));
    }

    #[test]
    fn max_quality_excludes_png_for_legacy_clients() {
        assert_eq!(max_quality(true), 101);
        assert_eq!(max_quality(false), 100);
    }
}
