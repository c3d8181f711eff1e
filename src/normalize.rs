//! Address clean-up ahead of geocoding.
//!
//! Listing sites prepend complex names (`"The Monarch | 801 W 5th St"`) and
//! append unit designators that confuse geocoders. Both are stripped here; the
//! presence of a unit is reported so the resolver can spread units of one
//! building apart on the map.

use once_cell::sync::Lazy;
use regex::Regex;

const BUILDING_SEPARATOR: char = '|';

static UNIT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:apartment|apt|unit|suite|ste)\b\.?\s*#?\s*[a-z0-9][a-z0-9\-]*")
        .expect("unit token pattern")
});
static HASH_UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)#\s*[a-z0-9][a-z0-9\-]*").expect("hash unit pattern"));
// Shorthand like "A7-28" closing the address.
static TRAILING_UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+[a-z]\d+[\-\d]*$").expect("trailing unit pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));
static SPACE_BEFORE_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+,").expect("space-comma pattern"));
static REPEATED_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(?:\s*,)+").expect("repeated comma pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    pub cleaned_text: String,
    pub has_unit: bool,
}

impl NormalizedAddress {
    pub fn is_empty(&self) -> bool {
        self.cleaned_text.is_empty()
    }
}

pub fn normalize(raw: &str) -> NormalizedAddress {
    let street = strip_building_name(raw);

    let mut has_unit = false;
    let mut text = street.to_string();
    for pattern in [&*UNIT_TOKEN, &*HASH_UNIT] {
        if pattern.is_match(&text) {
            has_unit = true;
            text = pattern.replace_all(&text, "").into_owned();
        }
    }
    // bare shorthand only counts once a unit designator was seen; highway
    // names like "I35" end addresses too
    if has_unit {
        text = TRAILING_UNIT.replace(&text, "").into_owned();
    }

    NormalizedAddress {
        cleaned_text: tidy(&text),
        has_unit,
    }
}

fn strip_building_name(raw: &str) -> &str {
    match raw.split_once(BUILDING_SEPARATOR) {
        Some((_, rest)) => rest.split(BUILDING_SEPARATOR).next().unwrap_or(rest),
        None => raw,
    }
}

fn tidy(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text.trim(), " ");
    let collapsed = SPACE_BEFORE_COMMA.replace_all(&collapsed, ",");
    let collapsed = REPEATED_COMMA.replace_all(&collapsed, ",");
    collapsed
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}
