//! Coordinate extraction from scraped search pages.
//!
//! The page embeds its map state in several undocumented encodings that change
//! without notice, so extraction is a ranked chain of independent extractors.
//! The first candidate that lands inside the bounding box wins.

use regex::Regex;

use crate::geo::{BoundingBox, Coordinates};

pub trait CoordinateExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every `(lat, lon)` candidate in document order.
    fn candidates(&self, body: &str) -> Vec<Coordinates>;
}

/// Regex with two capture groups: latitude then longitude.
pub struct PatternExtractor {
    name: &'static str,
    pattern: Regex,
}

impl PatternExtractor {
    pub fn new(name: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
        })
    }
}

impl CoordinateExtractor for PatternExtractor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn candidates(&self, body: &str) -> Vec<Coordinates> {
        self.pattern
            .captures_iter(body)
            .filter_map(|caps| {
                let lat = caps.get(1)?.as_str().parse::<f64>().ok()?;
                let lon = caps.get(2)?.as_str().parse::<f64>().ok()?;
                Some(Coordinates::new(lat, lon))
            })
            .collect()
    }
}

const STANDARD_PATTERNS: &[(&str, &str)] = &[
    ("data-3d4d", r"!3d(-?\d+\.\d+)!4d(-?\d+\.\d+)"),
    ("json-lat-lng", r#""lat":\s*(-?\d+\.\d+),\s*"lng":\s*(-?\d+\.\d+)"#),
    (
        "json-latitude-longitude",
        r#""latitude":\s*(-?\d+\.\d+),\s*"longitude":\s*(-?\d+\.\d+)"#,
    ),
    ("at-sign", r"@(-?\d+\.\d+),(-?\d+\.\d+)"),
    ("center", r"center.*?(-?\d+\.\d+).*?(-?\d+\.\d+)"),
    ("bracket-pair", r"\[(-?\d+\.\d+),(-?\d+\.\d+)\]"),
];

pub struct ExtractorChain {
    extractors: Vec<Box<dyn CoordinateExtractor>>,
}

impl ExtractorChain {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    pub fn standard() -> Self {
        let extractors = STANDARD_PATTERNS
            .iter()
            .map(|(name, pattern)| {
                let extractor =
                    PatternExtractor::new(name, pattern).expect("built-in extractor pattern");
                Box::new(extractor) as Box<dyn CoordinateExtractor>
            })
            .collect();
        Self { extractors }
    }

    /// Append at the lowest rank.
    pub fn with(mut self, extractor: impl CoordinateExtractor + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn first_within(
        &self,
        body: &str,
        bounds: &BoundingBox,
    ) -> Option<(Coordinates, &'static str)> {
        self.extractors.iter().find_map(|extractor| {
            extractor
                .candidates(body)
                .into_iter()
                .find(|point| bounds.contains(point))
                .map(|point| (point, extractor.name()))
        })
    }
}
