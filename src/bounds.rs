use serde::{Deserialize, Serialize};

/// Closed latitude/longitude box describing the service's target region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat: min_lat.min(max_lat),
            max_lat: max_lat.max(min_lat),
            min_lng: min_lng.min(max_lng),
            max_lng: max_lng.max(min_lng),
        }
    }

    fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }

    /// True when the whole box lies west of the prime meridian.
    fn is_western(&self) -> bool {
        self.max_lng < 0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundsValidator {
    bounds: GeoBounds,
}

impl BoundsValidator {
    pub fn new(bounds: GeoBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> GeoBounds {
        self.bounds
    }

    pub fn validate(&self, lat: f64, lng: f64) -> bool {
        if !lat.is_finite() || !lng.is_finite() {
            return false;
        }
        // A western target never accepts an eastern longitude, whatever the box says.
        if self.bounds.is_western() && lng >= 0.0 {
            return false;
        }
        self.bounds.contains(lat, lng)
    }

    pub fn is_suspicious(&self, lat: f64, lng: f64) -> bool {
        !self.validate(lat, lng)
    }
}
