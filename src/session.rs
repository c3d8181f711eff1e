//! Simulated browser sessions for the scraping strategy.
//!
//! A [`SessionPool`] owns exactly one live [`SessionIdentity`] at a time. The
//! identity is replaced wholesale (new headers, new HTTP client, fresh request
//! counter) once it is worn out or the target answers with a block.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

/// Cumulative request count after which the base delay is multiplied.
const DELAY_ESCALATION: &[(u64, u32)] = &[(150, 4), (100, 3), (50, 2)];
const DELAY_JITTER_FACTOR: RangeInclusive<f64> = 1.5..=3.5;

const COMMON_HEADERS: &[(&str, &str)] = &[
    ("Cache-Control", "no-cache"),
    ("Pragma", "no-cache"),
    ("Upgrade-Insecure-Requests", "1"),
];

const ACCEPT_CHROMIUM: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";
const ACCEPT_FIREFOX: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_SAFARI: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

const CH_UA_CHROME_120: &str =
    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"";
const CH_UA_CHROME_119: &str =
    "\"Google Chrome\";v=\"119\", \"Chromium\";v=\"119\", \"Not?A_Brand\";v=\"24\"";
const CH_UA_EDGE_120: &str =
    "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Microsoft Edge\";v=\"120\"";

/// One internally consistent browser fingerprint.
#[derive(Debug)]
pub struct BrowserProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
}

pub static BROWSER_PROFILES: &[BrowserProfile] = &[
    BrowserProfile {
        name: "chrome-120-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        headers: &[
            ("Accept", ACCEPT_CHROMIUM),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("sec-ch-ua", CH_UA_CHROME_120),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"macOS\""),
        ],
    },
    BrowserProfile {
        name: "chrome-119-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        headers: &[
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
            ("Accept-Language", "en-US,en;q=0.8,es;q=0.6"),
            ("sec-ch-ua", CH_UA_CHROME_119),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"macOS\""),
        ],
    },
    BrowserProfile {
        name: "chrome-120-windows",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        headers: &[
            ("Accept", ACCEPT_CHROMIUM),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("sec-ch-ua", CH_UA_CHROME_120),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
        ],
    },
    BrowserProfile {
        name: "chrome-119-windows",
        user_agent: "Mozilla/5.0 (Windows NT 11.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        headers: &[
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
            ("Accept-Language", "en-US,en;q=0.9,fr;q=0.8"),
            ("sec-ch-ua", CH_UA_CHROME_119),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
        ],
    },
    BrowserProfile {
        name: "firefox-121-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
        headers: &[
            ("Accept", ACCEPT_FIREFOX),
            ("Accept-Language", "en-US,en;q=0.5"),
            ("DNT", "1"),
        ],
    },
    BrowserProfile {
        name: "firefox-120-windows",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
        headers: &[
            ("Accept", ACCEPT_FIREFOX),
            ("Accept-Language", "en-US,en;q=0.5"),
            ("DNT", "1"),
        ],
    },
    BrowserProfile {
        name: "firefox-121-linux",
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
        headers: &[
            ("Accept", ACCEPT_FIREFOX),
            ("Accept-Language", "en-US,en;q=0.5"),
            ("DNT", "1"),
        ],
    },
    BrowserProfile {
        name: "safari-17-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
        headers: &[
            ("Accept", ACCEPT_SAFARI),
            ("Accept-Language", "en-US,en;q=0.9"),
        ],
    },
    BrowserProfile {
        name: "safari-16-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Safari/605.1.15",
        headers: &[
            ("Accept", ACCEPT_SAFARI),
            ("Accept-Language", "en-us"),
        ],
    },
    BrowserProfile {
        name: "edge-120-windows",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
        headers: &[
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8"),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("sec-ch-ua", CH_UA_EDGE_120),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
        ],
    },
    BrowserProfile {
        name: "safari-17-iphone",
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
        headers: &[
            ("Accept", ACCEPT_SAFARI),
            ("Accept-Language", "en-US,en;q=0.9"),
        ],
    },
    BrowserProfile {
        name: "chrome-120-android",
        user_agent: "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
        headers: &[
            ("Accept", ACCEPT_CHROMIUM),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("sec-ch-ua", CH_UA_CHROME_120),
            ("sec-ch-ua-mobile", "?1"),
            ("sec-ch-ua-platform", "\"Android\""),
        ],
    },
];

impl BrowserProfile {
    /// Deterministic pick so repeated runs walk the pool in the same order.
    pub fn for_request_count(count: u64) -> &'static BrowserProfile {
        &BROWSER_PROFILES[(count % BROWSER_PROFILES.len() as u64) as usize]
    }

    fn header_map(&self) -> AppResult<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in self.headers.iter().chain(COMMON_HEADERS) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| AppError::Config(format!("bad header name {name}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| AppError::Config(format!("bad header value for {name}: {err}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub base_delay: Duration,
    pub request_timeout: Duration,
    pub rotate_after: RangeInclusive<u32>,
    pub max_age: Duration,
    pub rotation_pause_ms: RangeInclusive<u64>,
    pub block_cooldown_ms: RangeInclusive<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(15),
            rotate_after: 25..=30,
            max_age: Duration::from_secs(300),
            rotation_pause_ms: 5_000..=10_000,
            block_cooldown_ms: 30_000..=60_000,
        }
    }
}

pub struct SessionIdentity {
    serial: u64,
    profile: &'static BrowserProfile,
    client: reqwest::Client,
    request_count: AtomicU32,
    rotate_after: u32,
    created_at: DateTime<Utc>,
}

impl SessionIdentity {
    fn new(
        serial: u64,
        profile: &'static BrowserProfile,
        rotate_after: u32,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(profile.user_agent)
            .default_headers(profile.header_map()?)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            serial,
            profile,
            client,
            request_count: AtomicU32::new(0),
            rotate_after,
            created_at: Utc::now(),
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn profile(&self) -> &'static BrowserProfile {
        self.profile
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_worn_out(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default();
        self.request_count() >= self.rotate_after || age >= max_age
    }
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("serial", &self.serial)
            .field("profile", &self.profile.name)
            .field("request_count", &self.request_count())
            .field("rotate_after", &self.rotate_after)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Handed to a worker for exactly one outbound request.
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub identity: Arc<SessionIdentity>,
    /// Sleep owed before sending: escalated, jittered inter-request delay plus
    /// the post-rotation pause when this lease opened a new identity.
    pub delay: Duration,
    pub rotated: bool,
}

pub struct SessionPool {
    settings: SessionSettings,
    current: Mutex<Arc<SessionIdentity>>,
    next_serial: AtomicU64,
    total_requests: AtomicU64,
    rng: Mutex<StdRng>,
}

impl SessionPool {
    pub fn new(settings: SessionSettings) -> AppResult<Self> {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: SessionSettings, mut rng: StdRng) -> AppResult<Self> {
        let rotate_after = rng.gen_range(settings.rotate_after.clone());
        let first = SessionIdentity::new(
            0,
            BrowserProfile::for_request_count(0),
            rotate_after,
            settings.request_timeout,
        )?;
        info!(profile = first.profile.name, "initialized browser session");
        Ok(Self {
            settings,
            current: Mutex::new(Arc::new(first)),
            next_serial: AtomicU64::new(1),
            total_requests: AtomicU64::new(0),
            rng: Mutex::new(rng),
        })
    }

    pub fn current(&self) -> Arc<SessionIdentity> {
        Arc::clone(&self.current.lock())
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    /// Reserve one request on the live identity, rotating it first when it has
    /// hit its request threshold or age ceiling.
    pub fn checkout(&self) -> AppResult<SessionLease> {
        let mut current = self.current.lock();
        let mut rotated = false;
        if current.is_worn_out(Utc::now(), self.settings.max_age) {
            debug!(
                serial = current.serial,
                requests = current.request_count(),
                "session worn out; rotating"
            );
            *current = Arc::new(self.spawn_identity()?);
            rotated = true;
        }

        current.request_count.fetch_add(1, Ordering::SeqCst);
        let total = self.total_requests.fetch_add(1, Ordering::SeqCst) + 1;

        let mut delay = self.request_delay(total);
        if rotated {
            delay += self.sample_ms(&self.settings.rotation_pause_ms);
        }

        Ok(SessionLease {
            identity: Arc::clone(&current),
            delay,
            rotated,
        })
    }

    /// The target answered 429 for `blocked`. Replaces the identity unless a
    /// concurrent worker already did, and returns the cooldown to serve before
    /// the next attempt.
    pub fn report_block(&self, blocked: &SessionIdentity) -> AppResult<Duration> {
        {
            let mut current = self.current.lock();
            if current.serial == blocked.serial {
                *current = Arc::new(self.spawn_identity()?);
                warn!(
                    blocked_serial = blocked.serial,
                    serial = current.serial,
                    profile = current.profile.name,
                    "rate limited; forced session rotation"
                );
            }
        }
        Ok(self.sample_ms(&self.settings.block_cooldown_ms))
    }

    fn spawn_identity(&self) -> AppResult<SessionIdentity> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let profile = BrowserProfile::for_request_count(self.total_requests());
        let rotate_after = self.rng.lock().gen_range(self.settings.rotate_after.clone());
        let identity =
            SessionIdentity::new(serial, profile, rotate_after, self.settings.request_timeout)?;
        info!(serial, profile = profile.name, "initialized fresh browser session");
        Ok(identity)
    }

    fn request_delay(&self, total_requests: u64) -> Duration {
        let base = self
            .settings
            .base_delay
            .mul_f64(escalation_factor(total_requests) as f64);
        if base.is_zero() {
            return base;
        }
        let factor = self.rng.lock().gen_range(DELAY_JITTER_FACTOR);
        base.mul_f64(factor)
    }

    fn sample_ms(&self, range: &RangeInclusive<u64>) -> Duration {
        Duration::from_millis(self.rng.lock().gen_range(range.clone()))
    }

    #[cfg(test)]
    fn backdate_current(&self, by: chrono::Duration) {
        let mut current = self.current.lock();
        if let Some(identity) = Arc::get_mut(&mut current) {
            identity.created_at -= by;
        }
    }
}

pub fn escalation_factor(total_requests: u64) -> u32 {
    DELAY_ESCALATION
        .iter()
        .find(|(threshold, _)| total_requests > *threshold)
        .map(|(_, factor)| *factor)
        .unwrap_or(1)
}
