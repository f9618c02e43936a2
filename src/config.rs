//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled default and an env override, parsed once at
//! startup with `env_parse`. The struct is `Copy` and embedded in
//! `AppState` so services read policy without touching the environment.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_ROOM_MEMBERS: usize = 16;
const DEFAULT_RECONNECT_GRACE_SECS: u64 = 60;
const DEFAULT_STROKE_PENDING_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_STROKE_POINTS: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// TCP port the server binds to.
    pub port: u16,
    /// Join attempts beyond this member count are rejected Full.
    pub max_room_members: usize,
    /// How long a disconnected member keeps their room seat.
    pub reconnect_grace: Duration,
    /// Pending strokes older than this are discarded by the sweeper.
    pub stroke_pending_timeout: Duration,
    /// Sweeper wake-up interval.
    pub sweep_interval: Duration,
    /// Per-connection outbound frame queue depth.
    pub client_channel_capacity: usize,
    /// Hard cap on points per stroke.
    pub max_stroke_points: usize,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            max_room_members: env_parse("MAX_ROOM_MEMBERS", DEFAULT_MAX_ROOM_MEMBERS),
            reconnect_grace: Duration::from_secs(env_parse(
                "RECONNECT_GRACE_SECS",
                DEFAULT_RECONNECT_GRACE_SECS,
            )),
            stroke_pending_timeout: Duration::from_secs(env_parse(
                "STROKE_PENDING_TIMEOUT_SECS",
                DEFAULT_STROKE_PENDING_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY),
            max_stroke_points: env_parse("MAX_STROKE_POINTS", DEFAULT_MAX_STROKE_POINTS),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_room_members: DEFAULT_MAX_ROOM_MEMBERS,
            reconnect_grace: Duration::from_secs(DEFAULT_RECONNECT_GRACE_SECS),
            stroke_pending_timeout: Duration::from_secs(DEFAULT_STROKE_PENDING_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            max_stroke_points: DEFAULT_MAX_STROKE_POINTS,
        }
    }
}

pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
