//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>` where the MAC is
//! computed over `"<t>.<raw payload>"` with the shared webhook secret. More
//! than one `v1` entry may be present during secret rotation.

use chrono::Duration;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use super::{ReconcileError, ReconcileResult};
use crate::types::SharedClock;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance: Duration,
    clock: SharedClock,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString, clock: SharedClock) -> Self {
        Self {
            secret,
            tolerance: Duration::seconds(DEFAULT_TOLERANCE_SECS),
            clock,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> ReconcileResult<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let Some(timestamp) = timestamp else {
            return Err(reject("missing or malformed timestamp"));
        };
        if signatures.is_empty() {
            return Err(reject("no v1 signature"));
        }

        let age = self
            .clock
            .now()
            .timestamp()
            .checked_sub(timestamp)
            .map(i64::unsigned_abs);
        match age {
            Some(age) if age <= self.tolerance.num_seconds().unsigned_abs() => {}
            _ => return Err(reject("timestamp outside tolerance")),
        }

        let expected = self.mac(timestamp, payload)?;
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bool::from(bytes.ct_eq(&expected)))
                .unwrap_or(false)
        });
        if matched {
            Ok(())
        } else {
            Err(reject("signature mismatch"))
        }
    }

    /// Header value for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> ReconcileResult<String> {
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(self.mac(timestamp, payload)?)
        ))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> ReconcileResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| ReconcileError::invalid(format!("unusable webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn reject(reason: &str) -> ReconcileError {
    warn!(reason, "Billing webhook signature rejected");
    ReconcileError::invalid(format!("signature verification failed: {}", reason))
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}
