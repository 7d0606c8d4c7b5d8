//! HMAC Authentication
//!
//! Clients prove knowledge of the server secret by signing
//! `token + ":" + timestamp` with HMAC-SHA256. The server recomputes the MAC
//! and compares in constant time. Timestamps further than the replay window
//! from the server clock are rejected.
//!
//! The secret lives for the life of the process; restarting the server
//! invalidates every outstanding credential.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::{BridgeConfig, REPLAY_WINDOW};
use crate::network::protocol::AuthCredentials;

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated secret.
pub const SECRET_LEN: usize = 32;

/// Symmetric signing key. `Debug` output is redacted.
#[derive(Clone)]
pub struct ServerSecret(Vec<u8>);

impl ServerSecret {
    /// Generate a random secret.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Use externally supplied key material.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSecret(<{} bytes redacted>)", self.0.len())
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A credential field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// Timestamp was not a number or numeric string.
    #[error("invalid timestamp")]
    InvalidTimestamp,
    /// Timestamp is outside the replay window.
    #[error("timestamp is {skew_secs:.0}s away from server time")]
    Expired {
        /// Absolute distance from the server clock.
        skew_secs: f64,
    },
    /// Signature did not match.
    #[error("invalid signature")]
    InvalidSignature,
    /// The secret could not key the MAC.
    #[error("invalid signing key")]
    InvalidKey,
}

impl AuthError {
    /// What the client should do about this failure.
    pub fn action(&self) -> &'static str {
        match self {
            AuthError::MissingField(_) => "send token, timestamp and signature",
            AuthError::InvalidTimestamp => "send the timestamp as Unix seconds",
            AuthError::Expired { .. } => "sync your clock and sign a fresh timestamp",
            AuthError::InvalidSignature => "sign token:timestamp with the shared secret",
            AuthError::InvalidKey => "contact the server operator",
        }
    }
}

/// Verifies and issues signed credentials.
#[derive(Clone, Debug)]
pub struct Authenticator {
    secret: ServerSecret,
    replay_window: Duration,
}

impl Authenticator {
    /// Create an authenticator.
    pub fn new(secret: ServerSecret, replay_window: Duration) -> Self {
        Self {
            secret,
            replay_window,
        }
    }

    /// Authenticator with a fresh random secret and the default window.
    pub fn generate() -> Self {
        Self::new(ServerSecret::generate(), REPLAY_WINDOW)
    }

    /// Use the configured secret, or generate one.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let secret = match &config.secret {
            Some(secret) => ServerSecret::from_bytes(secret.as_bytes()),
            None => ServerSecret::generate(),
        };
        Self::new(secret, config.replay_window)
    }

    /// Check credentials against the current clock. Returns the token.
    pub fn verify(&self, credentials: &AuthCredentials) -> Result<String, AuthError> {
        self.verify_at(credentials, unix_now())
    }

    /// Check credentials against `now` (Unix seconds). Returns the token.
    pub fn verify_at(&self, credentials: &AuthCredentials, now: f64) -> Result<String, AuthError> {
        let token = credentials
            .token
            .as_deref()
            .ok_or(AuthError::MissingField("token"))?;
        let timestamp = credentials
            .timestamp
            .as_ref()
            .ok_or(AuthError::MissingField("timestamp"))?;
        let signature = credentials
            .signature
            .as_deref()
            .ok_or(AuthError::MissingField("signature"))?;

        let (timestamp_text, timestamp_secs) = parse_timestamp(timestamp)?;

        let skew_secs = (now - timestamp_secs).abs();
        if skew_secs > self.replay_window.as_secs_f64() {
            return Err(AuthError::Expired { skew_secs });
        }

        let expected = self.mac(token, &timestamp_text)?;
        let supplied = hex::decode(signature.trim()).map_err(|_| AuthError::InvalidSignature)?;

        if expected.as_slice().ct_eq(supplied.as_slice()).into() {
            Ok(token.to_string())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }

    /// Hex signature for `token` at `timestamp` (as it will appear on the wire).
    pub fn sign(&self, token: &str, timestamp: &str) -> Result<String, AuthError> {
        Ok(hex::encode(self.mac(token, timestamp)?))
    }

    /// Fresh credentials for `token`, timestamped now.
    pub fn issue(&self, token: &str) -> Result<AuthCredentials, AuthError> {
        let timestamp = unix_now().floor() as u64;
        let signature = self.sign(token, &timestamp.to_string())?;
        Ok(AuthCredentials {
            token: Some(token.to_string()),
            timestamp: Some(Value::from(timestamp)),
            signature: Some(signature),
        })
    }

    fn mac(&self, token: &str, timestamp: &str) -> Result<Vec<u8>, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
        mac.update(token.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Signed text and numeric value of a wire timestamp.
fn parse_timestamp(value: &Value) -> Result<(String, f64), AuthError> {
    let (text, secs) = match value {
        Value::Number(n) => (n.to_string(), n.as_f64()),
        Value::String(s) => (s.clone(), s.trim().parse::<f64>().ok()),
        _ => return Err(AuthError::InvalidTimestamp),
    };
    match secs {
        Some(secs) if secs.is_finite() => Ok((text, secs)),
        _ => Err(AuthError::InvalidTimestamp),
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
