//! Location verification by name comparison.
//!
//! Geolocation is not wired in yet: `current_location` and
//! `calculate_distance` return fixed values so callers can depend on the
//! interface today.

use serde::Serialize;

pub const EXACT_MATCH_CONFIDENCE: f64 = 1.0;
pub const PARTIAL_MATCH_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationCheck {
    pub is_match: bool,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocationService;

impl LocationService {
    /// Compare a claimed location against the required one.
    ///
    /// Both sides are trimmed and lower-cased.  Equality scores
    /// [`EXACT_MATCH_CONFIDENCE`], containment in either direction scores
    /// [`PARTIAL_MATCH_CONFIDENCE`], anything else is a mismatch.
    pub fn verify_location(&self, required: &str, provided: &str) -> LocationCheck {
        let required_norm = required.trim().to_lowercase();
        let provided_norm = provided.trim().to_lowercase();

        if required_norm == provided_norm {
            return LocationCheck {
                is_match: true,
                confidence: EXACT_MATCH_CONFIDENCE,
                reason: "Exact location match".to_string(),
            };
        }

        if required_norm.contains(&provided_norm) || provided_norm.contains(&required_norm) {
            return LocationCheck {
                is_match: true,
                confidence: PARTIAL_MATCH_CONFIDENCE,
                reason: "Partial location match".to_string(),
            };
        }

        LocationCheck {
            is_match: false,
            confidence: 0.0,
            reason: format!("Location mismatch: Required \"{required}\", Got \"{provided}\""),
        }
    }

    // TODO: resolve from client IP once a geolocation provider is configured.
    pub fn current_location(&self) -> &'static str {
        "New York"
    }

    /// Placeholder distance: 0 for the same place, 100 otherwise.
    pub fn calculate_distance(&self, a: &str, b: &str) -> u32 {
        if a.to_lowercase() == b.to_lowercase() {
            0
        } else {
            100
        }
    }
}
