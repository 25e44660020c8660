//! Maps a free-text declared location to the label rendered beside a handle.

use crate::config::LabelStyle;
use crate::protocol::UNKNOWN_LABEL;

/// Known regions in match order. The first case-insensitive substring hit wins.
const KNOWN_REGIONS: &[(&str, &str)] = &[
    ("United States", "US"),
    ("Canada", "CA"),
    ("Morocco", "MA"),
    ("Japan", "JP"),
    ("South Korea", "KR"),
    ("United Kingdom", "GB"),
    ("France", "FR"),
    ("Germany", "DE"),
];

const REGIONAL_INDICATOR_A: u32 = 0x1F1E6;

/// Resolves raw locations into display labels in one configured style.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelResolver {
    style: LabelStyle,
}

impl LabelResolver {
    pub fn new(style: LabelStyle) -> Self {
        Self { style }
    }

    /// Returns the label for `raw_location`.
    ///
    /// A known region yields its name (or flag); anything else is returned
    /// verbatim, and empty input yields [`UNKNOWN_LABEL`].
    pub fn resolve(&self, raw_location: Option<&str>) -> String {
        let Some(raw) = raw_location.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return UNKNOWN_LABEL.to_string();
        };
        match match_region(raw) {
            Some((name, code)) => match self.style {
                LabelStyle::Name => name.to_string(),
                LabelStyle::Flag => flag_emoji(code).unwrap_or_else(|| name.to_string()),
            },
            None => raw.to_string(),
        }
    }
}

fn match_region(raw: &str) -> Option<(&'static str, &'static str)> {
    let lowered = raw.to_lowercase();
    KNOWN_REGIONS
        .iter()
        .copied()
        .find(|(name, _)| lowered.contains(&name.to_lowercase()))
}

/// Builds the regional-indicator pair for a two-letter country code.
pub fn flag_emoji(country_code: &str) -> Option<String> {
    if country_code.len() != 2 || !country_code.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return None;
    }
    country_code
        .to_ascii_uppercase()
        .chars()
        .map(|ch| char::from_u32(REGIONAL_INDICATOR_A + (ch as u32 - 'A' as u32)))
        .collect()
}
