use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::geo::BoundingBox;
use crate::orchestrator::BatchSettings;
use crate::retry::RetryPolicy;
use crate::session::SessionSettings;

const DEFAULT_API_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_SEARCH_BASE_URL: &str = "https://www.google.com/maps/search/";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_cooldown_ms: u64,
    pub block_cooldown_min_ms: u64,
    pub block_cooldown_max_ms: u64,
    pub rotation_pause_min_ms: u64,
    pub rotation_pause_max_ms: u64,
    pub session_min_requests: u32,
    pub session_max_requests: u32,
    pub session_max_age_secs: u64,
    pub unit_jitter_degrees: f64,
    pub bounds: BoundingBox,
    pub region: String,
    pub required_address_fragment: Option<String>,
    pub api_endpoint: String,
    pub search_base_url: String,
    pub google_geocoding_api_key: Option<SecretString>,
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub request_delay_ms: u64,
    pub max_retries: u32,
    pub retry_cooldown_ms: u64,
    pub session_requests: (u32, u32),
    pub session_max_age_secs: u64,
    pub bounds: BoundingBox,
    pub region: String,
    pub required_address_fragment: Option<String>,
    pub has_google_geocoding_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let session_min_requests = parse_u32("GEOCODER_SESSION_MIN_REQUESTS", 25).max(1);
        let block_cooldown_min_ms = parse_u64("GEOCODER_BLOCK_COOLDOWN_MIN_MS", 30_000);
        let rotation_pause_min_ms = parse_u64("GEOCODER_ROTATION_PAUSE_MIN_MS", 5_000);
        Self {
            workers: parse_usize("GEOCODER_WORKERS", 5).max(1),
            batch_size: parse_usize("GEOCODER_BATCH_SIZE", 25).max(1),
            inter_batch_delay_ms: parse_u64("GEOCODER_INTER_BATCH_DELAY_MS", 10_000),
            request_delay_ms: parse_u64("GEOCODER_REQUEST_DELAY_MS", 500),
            request_timeout_secs: parse_u64("GEOCODER_REQUEST_TIMEOUT_SECS", 15).max(1),
            max_retries: parse_u32("GEOCODER_MAX_RETRIES", 3).max(1),
            retry_cooldown_ms: parse_u64("GEOCODER_RETRY_COOLDOWN_MS", 30_000),
            block_cooldown_min_ms,
            block_cooldown_max_ms: parse_u64("GEOCODER_BLOCK_COOLDOWN_MAX_MS", 60_000)
                .max(block_cooldown_min_ms),
            rotation_pause_min_ms,
            rotation_pause_max_ms: parse_u64("GEOCODER_ROTATION_PAUSE_MAX_MS", 10_000)
                .max(rotation_pause_min_ms),
            session_min_requests,
            session_max_requests: parse_u32("GEOCODER_SESSION_MAX_REQUESTS", 30)
                .max(session_min_requests),
            session_max_age_secs: parse_u64("GEOCODER_SESSION_MAX_AGE_SECS", 300).max(1),
            unit_jitter_degrees: parse_f64("GEOCODER_UNIT_JITTER_DEGREES", 0.0002).abs(),
            bounds: parse_bounds(),
            region: env::var("GEOCODER_REGION").unwrap_or_else(|_| "us".to_string()),
            required_address_fragment: env::var("GEOCODER_REQUIRED_ADDRESS_FRAGMENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_endpoint: env::var("GEOCODER_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_API_ENDPOINT.to_string()),
            search_base_url: env::var("GEOCODER_SEARCH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SEARCH_BASE_URL.to_string()),
            google_geocoding_api_key: env::var("GOOGLE_GEOCODING_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            log_file: env::var("GEOCODER_LOG_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            inter_batch_delay_ms: self.inter_batch_delay_ms,
            request_delay_ms: self.request_delay_ms,
            max_retries: self.max_retries,
            retry_cooldown_ms: self.retry_cooldown_ms,
            session_requests: (self.session_min_requests, self.session_max_requests),
            session_max_age_secs: self.session_max_age_secs,
            bounds: self.bounds,
            region: self.region.clone(),
            required_address_fragment: self.required_address_fragment.clone(),
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            base_delay: Duration::from_millis(self.request_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            rotate_after: self.session_min_requests..=self.session_max_requests,
            max_age: Duration::from_secs(self.session_max_age_secs),
            rotation_pause_ms: self.rotation_pause_min_ms..=self.rotation_pause_max_ms,
            block_cooldown_ms: self.block_cooldown_min_ms..=self.block_cooldown_max_ms,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_cooldown_ms),
        )
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            workers: self.workers,
            batch_size: self.batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bounds() -> BoundingBox {
    let defaults = BoundingBox::default();
    let candidate = BoundingBox::new(
        parse_f64("GEOCODER_BOUNDS_MIN_LAT", defaults.min_lat),
        parse_f64("GEOCODER_BOUNDS_MAX_LAT", defaults.max_lat),
        parse_f64("GEOCODER_BOUNDS_MIN_LON", defaults.min_lon),
        parse_f64("GEOCODER_BOUNDS_MAX_LON", defaults.max_lon),
    );
    match candidate {
        Ok(bounds) => bounds,
        Err(err) => {
            warn!(%err, "ignoring configured bounding box");
            defaults
        }
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
