use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::extract::ExtractorChain;
use crate::geo::{BoundingBox, Coordinates};
use crate::normalize::NormalizedAddress;
use crate::session::SessionPool;

/// One way of turning an address into coordinates. `Ok(None)` means the
/// strategy ran but found nothing inside the bounding box.
#[async_trait]
pub trait GeocodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn locate(&self, address: &NormalizedAddress) -> AppResult<Option<Coordinates>>;
}

pub struct CoordinateResolver {
    strategies: Vec<Arc<dyn GeocodeStrategy>>,
    jitter: UnitJitter,
}

impl CoordinateResolver {
    /// Authoritative API first when a key is configured, scraping always.
    pub fn new(config: &AppConfig, sessions: Arc<SessionPool>) -> AppResult<Self> {
        let mut strategies: Vec<Arc<dyn GeocodeStrategy>> = Vec::new();
        if let Some(key) = config.google_geocoding_api_key.clone() {
            strategies.push(Arc::new(GeocodingApiClient::new(
                &config.api_endpoint,
                key,
                config.region.clone(),
                config.bounds,
                Duration::from_secs(config.request_timeout_secs),
            )?));
        }
        strategies.push(Arc::new(SearchPageScraper::new(
            sessions,
            &config.search_base_url,
            ExtractorChain::standard(),
            config.bounds,
        )?));
        Ok(Self {
            strategies,
            jitter: UnitJitter::new(config.unit_jitter_degrees, config.bounds, StdRng::from_entropy()),
        })
    }

    pub fn from_strategies(strategies: Vec<Arc<dyn GeocodeStrategy>>, jitter: UnitJitter) -> Self {
        Self { strategies, jitter }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Tries each strategy in order. A rate-limit signal stops the chain
    /// immediately; other strategy errors fall through to the next strategy
    /// and are only reported when nothing matched.
    pub async fn resolve(&self, address: &NormalizedAddress) -> AppResult<Option<Coordinates>> {
        let mut last_error = None;
        for strategy in &self.strategies {
            match strategy.locate(address).await {
                Ok(Some(point)) => {
                    trace!(strategy = strategy.name(), ?point, "address resolved");
                    return Ok(Some(self.jitter.apply(point, address.has_unit)));
                }
                Ok(None) => {
                    debug!(strategy = strategy.name(), address = %address.cleaned_text, "no match");
                }
                Err(err @ AppError::RateLimited { .. }) => return Err(err),
                Err(err) => {
                    warn!(strategy = strategy.name(), error = %err, "strategy failed; trying next");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

/// Spreads units of one building apart so they do not stack on one map pixel.
pub struct UnitJitter {
    max_offset: f64,
    bounds: BoundingBox,
    rng: Mutex<StdRng>,
}

impl UnitJitter {
    pub fn new(max_offset_degrees: f64, bounds: BoundingBox, rng: StdRng) -> Self {
        Self {
            max_offset: max_offset_degrees.abs(),
            bounds,
            rng: Mutex::new(rng),
        }
    }

    pub fn apply(&self, point: Coordinates, has_unit: bool) -> Coordinates {
        if !has_unit || self.max_offset == 0.0 {
            return point;
        }
        let mut rng = self.rng.lock();
        let mut jittered = point;
        for _ in 0..MAX_JITTER_DRAWS {
            let dlat = rng.gen_range(-self.max_offset..=self.max_offset);
            let dlon = rng.gen_range(-self.max_offset..=self.max_offset);
            jittered = self.bounds.clamp(Coordinates::new(
                reflect_into(point.lat, dlat, self.bounds.min_lat, self.bounds.max_lat),
                reflect_into(point.lon, dlon, self.bounds.min_lon, self.bounds.max_lon),
            ));
            if jittered != point {
                break;
            }
        }
        jittered
    }
}

const MAX_JITTER_DRAWS: usize = 16;

/// Applies `offset` to `value`, flipping its sign when that would leave
/// `min..=max`, so points on the box edge still move inward.
fn reflect_into(value: f64, offset: f64, min: f64, max: f64) -> f64 {
    let shifted = value + offset;
    if (min..=max).contains(&shifted) {
        shifted
    } else {
        value - offset
    }
}

/// Structured geocoding API, only used with a configured key.
pub struct GeocodingApiClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: SecretString,
    region: String,
    bounds: BoundingBox,
}

impl GeocodingApiClient {
    pub fn new(
        endpoint: &str,
        api_key: SecretString,
        region: String,
        bounds: BoundingBox,
        timeout: Duration,
    ) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid geocoding endpoint: {err}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            region,
            bounds,
        })
    }
}

#[async_trait]
impl GeocodeStrategy for GeocodingApiClient {
    fn name(&self) -> &'static str {
        "geocoding-api"
    }

    async fn locate(&self, address: &NormalizedAddress) -> AppResult<Option<Coordinates>> {
        #[derive(serde::Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(serde::Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(serde::Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let bounds = self.bounds.as_bounds_param();
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("address", address.cleaned_text.as_str()),
                ("key", self.api_key.expose_secret()),
                ("bounds", bounds.as_str()),
                ("region", self.region.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        match parsed.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            other => {
                return Err(AppError::Upstream(format!(
                    "geocoding api status {other}: {}",
                    parsed.error_message.unwrap_or_default()
                )))
            }
        }

        Ok(parsed
            .results
            .into_iter()
            .next()
            .map(|result| Coordinates::new(result.geometry.location.lat, result.geometry.location.lng))
            .filter(|point| self.bounds.contains(point)))
    }
}

/// Unauthenticated fallback: fetch the public search page through the current
/// browser session and pull coordinates out of the raw body.
pub struct SearchPageScraper {
    sessions: Arc<SessionPool>,
    search_base: Url,
    extractors: ExtractorChain,
    bounds: BoundingBox,
}

impl SearchPageScraper {
    pub fn new(
        sessions: Arc<SessionPool>,
        search_base: &str,
        extractors: ExtractorChain,
        bounds: BoundingBox,
    ) -> AppResult<Self> {
        let search_base = Url::parse(search_base)
            .map_err(|err| AppError::Config(format!("invalid search base url: {err}")))?;
        if search_base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "search base url cannot carry a path: {search_base}"
            )));
        }
        Ok(Self {
            sessions,
            search_base,
            extractors,
            bounds,
        })
    }

    pub fn search_url(&self, address: &str) -> AppResult<Url> {
        let mut url = self.search_base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("search base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(address);
        Ok(url)
    }
}

#[async_trait]
impl GeocodeStrategy for SearchPageScraper {
    fn name(&self) -> &'static str {
        "search-page"
    }

    async fn locate(&self, address: &NormalizedAddress) -> AppResult<Option<Coordinates>> {
        let url = self.search_url(&address.cleaned_text)?;
        let lease = self.sessions.checkout()?;
        if !lease.delay.is_zero() {
            trace!(delay = ?lease.delay, rotated = lease.rotated, "pacing request");
            sleep(lease.delay).await;
        }

        let response = lease.identity.client().get(url).send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let cooldown = self.sessions.report_block(&lease.identity)?;
            return Err(AppError::RateLimited { cooldown });
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("search page returned {status}")));
        }

        let body = response.text().await?;
        trace!(bytes = body.len(), "search page fetched");
        Ok(self
            .extractors
            .first_within(&body, &self.bounds)
            .map(|(point, extractor)| {
                debug!(extractor, ?point, "coordinates extracted");
                point
            }))
    }
}
