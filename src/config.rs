//! Bridge Configuration
//!
//! Defaults match the documented wire behavior; the environment can override
//! the deployment knobs. Timing fields are public so tests can shorten them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default bind host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default first port tried.
pub const DEFAULT_PORT: u16 = 8765;

/// Consecutive ports tried before giving up.
pub const PORT_ATTEMPTS: u16 = 10;

/// Time a new connection has to authenticate.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(30);

/// Maximum accepted distance between a credential timestamp and now.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Polling loop cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File name used for the port file in the temp directory.
pub const PORT_FILE_NAME: &str = "pong-bridge.port";

/// Runtime configuration for the bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Bind host.
    pub host: String,
    /// First port tried.
    pub port: u16,
    /// Consecutive ports tried on `AddrInUse`.
    pub port_attempts: u16,
    /// Require the HMAC handshake before a session sees or changes anything.
    pub auth_enabled: bool,
    /// Signing secret. Generated at startup when absent.
    pub secret: Option<String>,
    /// Time a PENDING session has before it is closed.
    pub auth_deadline: Duration,
    /// Accepted timestamp skew for credentials.
    pub replay_window: Duration,
    /// Polling loop cadence.
    pub poll_interval: Duration,
    /// Where to write the bound port. `None` disables.
    pub port_file: Option<PathBuf>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Depth of each session's outbound queue.
    pub outbound_capacity: usize,
    /// Time the transport waits for the simulation to apply a command.
    pub command_timeout: Duration,
    /// Time `stop` waits for the scheduler thread.
    pub join_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            port_attempts: PORT_ATTEMPTS,
            auth_enabled: true,
            secret: None,
            auth_deadline: AUTH_DEADLINE,
            replay_window: REPLAY_WINDOW,
            poll_interval: POLL_INTERVAL,
            port_file: Some(std::env::temp_dir().join(PORT_FILE_NAME)),
            max_connections: 256,
            outbound_capacity: 256,
            command_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Create config from environment variables.
    ///
    /// `PONG_BRIDGE_HOST`, `PONG_BRIDGE_PORT`, `PONG_BRIDGE_AUTH`,
    /// `PONG_BRIDGE_SECRET`, `PONG_BRIDGE_PORT_FILE` (empty disables) and
    /// `PONG_BRIDGE_MAX_CONNECTIONS`. Unparseable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("PONG_BRIDGE_HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PONG_BRIDGE_PORT") {
            config.port = port;
        }
        if let Some(enabled) = lookup("PONG_BRIDGE_AUTH") {
            match parse_flag(&enabled) {
                Some(flag) => config.auth_enabled = flag,
                None => warn!("Ignoring PONG_BRIDGE_AUTH={:?}", enabled),
            }
        }
        if let Some(secret) = lookup("PONG_BRIDGE_SECRET").filter(|s| !s.is_empty()) {
            config.secret = Some(secret);
        }
        if let Some(path) = lookup("PONG_BRIDGE_PORT_FILE") {
            config.port_file = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(max) = parse_var(&lookup, "PONG_BRIDGE_MAX_CONNECTIONS") {
            config.max_connections = max;
        }

        config
    }

    /// Disable authentication.
    pub fn without_auth(mut self) -> Self {
        self.auth_enabled = false;
        self
    }

    /// Operator warning for a configuration no client can authenticate
    /// against: auth on, but the secret is generated and never shared.
    pub fn unshared_secret_warning(&self) -> Option<&'static str> {
        (self.auth_enabled && self.secret.is_none()).then_some(
            "Authentication is enabled but PONG_BRIDGE_SECRET is not set; the generated \
             secret is never shared, so no client can authenticate. Set PONG_BRIDGE_SECRET \
             to a shared secret or PONG_BRIDGE_AUTH=false to disable authentication",
        )
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}", key, raw);
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
