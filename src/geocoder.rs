use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::address::{has_region_signal, strip_country_suffix, CanonicalAddress, RegionProfile};
use crate::bounds::BoundsValidator;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub suspicious: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// Worth retrying on a later invocation.
    Transient { rate_limited: bool },
    /// Will not succeed without a different input address.
    Permanent,
}

impl FailureKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Transient { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FailureKind::Transient { rate_limited: true })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The record gained coordinates between listing and processing.
    AlreadyGeocoded,
    /// Stored coordinates were produced from the same canonical address.
    UpToDate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyGeocoded => f.write_str("record already has coordinates"),
            SkipReason::UpToDate => f.write_str("coordinates are current for this address"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "data")]
pub enum ResolutionOutcome {
    Resolved(GeocodeResult),
    Skipped(SkipReason),
    Failed { kind: FailureKind, detail: String },
}

impl ResolutionOutcome {
    pub fn transient(detail: impl Into<String>) -> Self {
        ResolutionOutcome::Failed {
            kind: FailureKind::Transient {
                rate_limited: false,
            },
            detail: detail.into(),
        }
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        ResolutionOutcome::Failed {
            kind: FailureKind::Transient { rate_limited: true },
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        ResolutionOutcome::Failed {
            kind: FailureKind::Permanent,
            detail: detail.into(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ResolutionOutcome::Failed { kind, .. } if kind.is_rate_limited())
    }
}

/// Resolves one canonical address against an external provider.
///
/// Implementations never touch the cache; callers own cache orchestration.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, address: &CanonicalAddress) -> ResolutionOutcome;
}

#[derive(Debug, Clone)]
pub struct GeocodeClientSettings {
    pub endpoint: String,
    pub user_agent: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub rate_limit_qps: u32,
    pub region: RegionProfile,
}

impl GeocodeClientSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.geocoder_endpoint.clone(),
            user_agent: config.geocoder_user_agent.clone(),
            api_key: config.geocoder_api_key.clone(),
            timeout: config.request_timeout(),
            rate_limit_qps: config.rate_limit_qps,
            region: RegionProfile::from_config(config),
        }
    }
}

/// Nominatim-compatible search client.
pub struct GeocodeClient {
    http: Client,
    search_url: Url,
    api_key: Option<SecretString>,
    region: RegionProfile,
    bounds: BoundsValidator,
    rate_limiter: RateLimiter,
}

impl GeocodeClient {
    pub fn new(settings: GeocodeClientSettings, bounds: BoundsValidator) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout)
            .build()?;

        let mut search_url = Url::parse(&settings.endpoint).map_err(|err| {
            AppError::Config(format!("invalid geocoder endpoint {}: {err}", settings.endpoint))
        })?;
        search_url
            .path_segments_mut()
            .map_err(|_| AppError::Config("geocoder endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .push("search");

        Ok(Self {
            http,
            search_url,
            api_key: settings.api_key,
            region: settings.region,
            bounds,
            rate_limiter: RateLimiter::new(settings.rate_limit_qps),
        })
    }

    /// Query text actually sent upstream for `address`.
    pub fn query_for(&self, address: &CanonicalAddress) -> String {
        let stripped = strip_country_suffix(address.as_str());
        if has_region_signal(&stripped, &self.region) {
            return stripped;
        }
        let qualifier = self.region.qualifier();
        if qualifier.is_empty() {
            stripped
        } else {
            format!("{stripped}, {qualifier}")
        }
    }

    fn request_url(&self, query: &str) -> Url {
        let mut url = self.search_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("format", "json")
                .append_pair("q", query)
                .append_pair("limit", "1")
                .append_pair("countrycodes", &self.region.country_code)
                .append_pair("addressdetails", "1");
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key.expose_secret());
            }
        }
        url
    }

    fn classify_body(&self, body: &str) -> ResolutionOutcome {
        let places: Vec<SearchPlace> = match serde_json::from_str(body) {
            Ok(places) => places,
            Err(err) => {
                return ResolutionOutcome::permanent(format!("unparseable geocoder response: {err}"))
            }
        };
        let Some(place) = places.into_iter().next() else {
            return ResolutionOutcome::permanent("geocoder returned no results");
        };

        let country = place
            .address
            .as_ref()
            .and_then(|details| details.country_code.as_deref())
            .map(str::to_ascii_lowercase);
        if let Some(country) = country {
            if !country.eq_ignore_ascii_case(&self.region.country_code) {
                return ResolutionOutcome::permanent(format!(
                    "country mismatch: expected {}, got {country}",
                    self.region.country_code
                ));
            }
        }

        let (Some(latitude), Some(longitude)) = (place.lat, place.lon) else {
            return ResolutionOutcome::permanent("geocoder result is missing coordinates");
        };
        ResolutionOutcome::Resolved(GeocodeResult {
            latitude,
            longitude,
            suspicious: self.bounds.is_suspicious(latitude, longitude),
        })
    }
}

#[async_trait]
impl Geocoder for GeocodeClient {
    async fn resolve(&self, address: &CanonicalAddress) -> ResolutionOutcome {
        let query = self.query_for(address);
        self.rate_limiter.wait().await;

        let response = match self.http.get(self.request_url(&query)).send().await {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_timeout() {
                    "geocoder request timed out"
                } else {
                    "geocoder request failed"
                };
                warn!(target: "geocode_client", error = %err, %query, "{reason}");
                return ResolutionOutcome::transient(format!("{reason}: {err}"));
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(target: "geocode_client", %query, "geocoder rate limit hit");
            return ResolutionOutcome::rate_limited("geocoder rate limit exceeded (HTTP 429)");
        }
        if status != StatusCode::OK {
            return ResolutionOutcome::permanent(format!("geocoder returned HTTP {status}"));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                return ResolutionOutcome::transient(format!("failed to read geocoder response: {err}"))
            }
        };
        let outcome = self.classify_body(&body);
        debug!(target: "geocode_client", %query, ?outcome, "geocoder lookup finished");
        outcome
    }
}

#[derive(Deserialize)]
struct SearchPlace {
    #[serde(default, deserialize_with = "coordinate")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "coordinate")]
    lon: Option<f64>,
    address: Option<SearchAddress>,
}

#[derive(Deserialize)]
struct SearchAddress {
    country_code: Option<String>,
}

/// Nominatim sends coordinates as strings; some compatible providers send numbers.
fn coordinate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(value)) => Some(value),
        Some(Raw::Text(text)) => text.trim().parse::<f64>().ok(),
        None => None,
    }
    .filter(|value| value.is_finite()))
}

/// Enforces a minimum spacing between outbound requests.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        (1000_f64 / safe_qps as f64).ceil() as u64
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
