use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

static STATE_ZIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z]{2}\s+\d{5}(?:-\d{4})?\b").expect("state and zip pattern")
});

static BARE_ZIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{5}(?:-\d{4})?$").expect("bare zip pattern"));

static COUNTRY_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[\s,]+)(?:usa|u\.s\.a\.?|us|u\.s\.|united states(?: of america)?)[\s,]*$")
        .expect("country suffix pattern")
});

const COUNTRY_TOKENS: &[&str] = &[
    "usa",
    "u.s.a.",
    "u.s.a",
    "us",
    "u.s.",
    "united states",
    "united states of america",
];

/// Raw address columns as the record store holds them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFields {
    pub address: String,
    pub city: String,
    pub region: String,
    pub postal_code: String,
}

impl AddressFields {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = city.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_postal_code(mut self, postal_code: impl Into<String>) -> Self {
        self.postal_code = postal_code.into();
        self
    }
}

/// Deduplicated, region-qualified address text. Never blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalAddress(String);

impl CanonicalAddress {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if !has_alphanumeric(trimmed) {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Lowercased form with whitespace collapsed inside and around segments.
    pub fn comparison_form(&self) -> String {
        comparison_form(&self.0)
    }

    pub fn matches(&self, other: &str) -> bool {
        self.comparison_form() == comparison_form(other)
    }
}

impl fmt::Display for CanonicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Region context used to decide whether an address is already qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionProfile {
    pub code: String,
    pub name: String,
    pub country_code: String,
    pub country_name: String,
}

impl RegionProfile {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            code: config.home_region.clone(),
            name: config.home_region_name.clone(),
            country_code: config.country_code.clone(),
            country_name: config.country_name.clone(),
        }
    }

    /// "Massachusetts, USA" style suffix for queries with no region signal.
    pub fn qualifier(&self) -> String {
        let region = if self.name.trim().is_empty() {
            self.code.trim()
        } else {
            self.name.trim()
        };
        [region, self.country_name.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct AddressNormalizer {
    profile: RegionProfile,
}

impl AddressNormalizer {
    pub fn new(profile: RegionProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &RegionProfile {
        &self.profile
    }

    /// Builds the canonical address for a record, or `None` when the record
    /// carries no usable primary address line.
    pub fn normalize(&self, fields: &AddressFields) -> Option<CanonicalAddress> {
        let line = fields.address.trim();
        if !has_alphanumeric(line) {
            return None;
        }

        let mut segments = split_segments(&strip_country_suffix(line));
        drop_repeated_tail(&mut segments);
        let mut cleaned = strip_country_suffix(&segments.join(", "));
        if !has_alphanumeric(&cleaned) {
            return None;
        }

        if !has_region_signal(&cleaned, &self.profile) {
            let mut segments = split_segments(&cleaned);
            let region = non_blank(&fields.region).or_else(|| non_blank(&self.profile.code));
            let extras = [non_blank(&fields.city), region, non_blank(&fields.postal_code)];
            for extra in extras.into_iter().flatten() {
                if !segments.iter().any(|segment| same_segment(segment, extra)) {
                    segments.push(extra.to_string());
                }
            }
            cleaned = segments.join(", ");
        }

        CanonicalAddress::new(cleaned)
    }
}

/// Removes trailing country tokens ("USA", "United States", "US").
pub fn strip_country_suffix(address: &str) -> String {
    let mut current = address.trim().to_string();
    loop {
        let next = COUNTRY_SUFFIX.replace(&current, "").trim().to_string();
        if next == current {
            break;
        }
        current = next;
    }
    current
        .trim_end_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

/// True when a segment after the street line names a state, zip or the home region.
pub fn has_region_signal(address: &str, profile: &RegionProfile) -> bool {
    if STATE_ZIP.is_match(address) {
        return true;
    }

    let region_code = profile.code.trim();
    let region_name = profile.name.trim();
    split_segments(address).iter().skip(1).any(|segment| {
        is_state_code(segment)
            || BARE_ZIP.is_match(segment)
            || (!region_code.is_empty() && segment.eq_ignore_ascii_case(region_code))
            || (!region_name.is_empty() && names_region(segment, region_name))
    })
}

/// A segment that is the region name, optionally followed by a zip.
fn names_region(segment: &str, region_name: &str) -> bool {
    let segment = comparison_form(segment);
    let name = comparison_form(region_name);
    match segment.strip_prefix(&name) {
        Some("") => true,
        Some(rest) => rest.starts_with(' ') && BARE_ZIP.is_match(rest.trim()),
        None => false,
    }
}

fn drop_repeated_tail(segments: &mut Vec<String>) {
    let significant: Vec<usize> = segments
        .iter()
        .enumerate()
        .filter(|(_, segment)| !is_country_token(segment))
        .map(|(index, _)| index)
        .collect();
    let count = significant.len();
    if count < 4 {
        return;
    }

    let tail_start = significant[count - 2];
    let tail_end = significant[count - 1];
    let repeated = significant[..count - 2].windows(2).any(|pair| {
        same_segment(&segments[pair[0]], &segments[tail_start])
            && same_segment(&segments[pair[1]], &segments[tail_end])
    });
    if repeated {
        segments.truncate(tail_start);
    }
}

fn split_segments(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|segment| has_alphanumeric(segment))
        .collect()
}

fn comparison_form(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split(',')
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join(",")
}

fn same_segment(left: &str, right: &str) -> bool {
    comparison_form(left) == comparison_form(right)
}

fn is_country_token(segment: &str) -> bool {
    let lowered = segment.trim().to_lowercase();
    COUNTRY_TOKENS.contains(&lowered.as_str())
}

fn is_state_code(segment: &str) -> bool {
    segment.len() == 2 && segment.chars().all(|c| c.is_ascii_alphabetic())
}

fn has_alphanumeric(value: &str) -> bool {
    value.chars().any(char::is_alphanumeric)
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
