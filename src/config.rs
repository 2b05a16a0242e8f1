//! Engine configuration
//!
//! Bounds and timings used by the room engine, with defaults matching
//! the public deployment and optional environment overrides.

use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::RoomError;

/// Default message time-to-live in seconds
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Smallest accepted room timer in seconds
pub const MIN_TTL_SECS: u64 = 10;

/// Largest accepted room timer in seconds
pub const MAX_TTL_SECS: u64 = 3600;

/// Largest accepted explicit user limit
pub const MAX_CAPACITY: u32 = 1000;

/// Implicit user limit for rooms created without secret and limit
pub const PUBLIC_ROOM_CAPACITY: u32 = 1000;

/// Typing flag inactivity timeout
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between a room closing and its purge
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Runtime configuration for `RoomEngine`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL applied when a room is created without one
    pub default_ttl: u64,
    /// Accepted TTL values (seconds)
    pub ttl_range: RangeInclusive<u64>,
    /// Accepted explicit capacity values
    pub capacity_range: RangeInclusive<u32>,
    /// Capacity given to public rooms created without a limit
    pub public_capacity: u32,
    /// How long a typing flag lives without a refresh
    pub typing_timeout: Duration,
    /// Grace interval between close and purge
    pub close_grace: Duration,
    /// Engine command channel size
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL_SECS,
            ttl_range: MIN_TTL_SECS..=MAX_TTL_SECS,
            capacity_range: 1..=MAX_CAPACITY,
            public_capacity: PUBLIC_ROOM_CAPACITY,
            typing_timeout: TYPING_TIMEOUT,
            close_grace: CLOSE_GRACE,
            command_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from defaults plus environment overrides
    ///
    /// Honours `HUSH_DEFAULT_TTL` (seconds), `HUSH_TYPING_TIMEOUT_MS` and
    /// `HUSH_CLOSE_GRACE_MS`. Unparseable or out-of-range values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ttl) = env_var::<u64>("HUSH_DEFAULT_TTL") {
            match config.validate_ttl(ttl) {
                Ok(ttl) => config.default_ttl = ttl,
                Err(e) => warn!("Ignoring HUSH_DEFAULT_TTL={}: {}", ttl, e),
            }
        }
        if let Some(ms) = env_var::<u64>("HUSH_TYPING_TIMEOUT_MS") {
            config.typing_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var::<u64>("HUSH_CLOSE_GRACE_MS") {
            config.close_grace = Duration::from_millis(ms);
        }

        config
    }

    /// Check a room timer against the accepted range
    pub fn validate_ttl(&self, ttl: u64) -> Result<u64, RoomError> {
        if self.ttl_range.contains(&ttl) {
            Ok(ttl)
        } else {
            Err(RoomError::InvalidTtl {
                min: *self.ttl_range.start(),
                max: *self.ttl_range.end(),
            })
        }
    }

    /// Check an explicit user limit against the accepted range
    pub fn validate_capacity(&self, capacity: u32) -> Result<u32, RoomError> {
        if self.capacity_range.contains(&capacity) {
            Ok(capacity)
        } else {
            Err(RoomError::InvalidCapacity {
                min: *self.capacity_range.start(),
                max: *self.capacity_range.end(),
            })
        }
    }
}

fn env_var<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
