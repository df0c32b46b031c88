//! Sec-MS-GEC security token generation.
//!
//! The service accepts a SHA-256 digest of the current 5-minute window (in
//! Windows file-time ticks) concatenated with the trusted client token. A
//! local clock that drifts from the server's gets a 403; the server `Date`
//! header from that response is used to correct the skew for later tokens.

use crate::error::{Result, TTSError, TransportFailure};
use chrono::DateTime;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1601-01-01 and 1970-01-01.
pub const WIN_EPOCH: u64 = 11_644_473_600;

/// Token validity window in seconds.
pub const TOKEN_WINDOW_SECONDS: u64 = 300;

pub const TRUSTED_CLIENT_TOKEN: &str = "6A5AA1D4EAFF4E9FB37E23D68491D6F4";

const TICKS_PER_SECOND: u128 = 10_000_000;

pub struct TokenGenerator {
    trusted_client_token: SecretString,
    // f64 seconds stored as raw bits
    clock_skew: AtomicU64,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new(SecretString::from(TRUSTED_CLIENT_TOKEN.to_string()))
    }
}

impl std::fmt::Debug for TokenGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGenerator")
            .field("clock_skew_seconds", &self.clock_skew_seconds())
            .finish_non_exhaustive()
    }
}

impl TokenGenerator {
    pub fn new(trusted_client_token: SecretString) -> Self {
        Self {
            trusted_client_token,
            clock_skew: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn trusted_client_token(&self) -> &str {
        self.trusted_client_token.expose_secret()
    }

    pub fn clock_skew_seconds(&self) -> f64 {
        f64::from_bits(self.clock_skew.load(Ordering::Acquire))
    }

    /// Add `delta` seconds to the accumulated skew.
    pub fn adjust_clock_skew(&self, delta: f64) {
        let _ = self
            .clock_skew
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Token for the current wall-clock time, skew included.
    pub fn generate_token(&self) -> String {
        self.generate_token_at(local_unix_seconds())
    }

    /// Token for an explicit local Unix time; the accumulated skew is still
    /// applied on top of `unix_seconds`.
    pub fn generate_token_at(&self, unix_seconds: f64) -> String {
        let corrected = unix_seconds + self.clock_skew_seconds();
        let window_start = window_start_file_time(corrected);
        let ticks = window_start as u128 * TICKS_PER_SECOND;

        let mut hasher = Sha256::new();
        hasher.update(format!("{}{}", ticks, self.trusted_client_token()).as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            hex.push_str(&format!("{:02X}", byte));
        }
        hex
    }

    /// Correct the skew from a rejected handshake.
    pub fn correct_skew(&self, failure: &TransportFailure) -> Result<()> {
        self.correct_skew_at(failure.server_date.as_deref(), local_unix_seconds())
    }

    pub fn correct_skew_at(&self, server_date: Option<&str>, local_unix: f64) -> Result<()> {
        let server_date = server_date.ok_or_else(|| {
            TTSError::Configuration("No server date in rejected handshake headers".to_string())
        })?;
        let server_time = parse_http_date(server_date).ok_or_else(|| {
            TTSError::Configuration(format!("Failed to parse server date: {}", server_date))
        })?;

        let client_time = local_unix + self.clock_skew_seconds();
        let delta = server_time - client_time;
        self.adjust_clock_skew(delta);
        log::info!(
            "🕒 Adjusted clock skew by {:.3}s (now {:.3}s)",
            delta,
            self.clock_skew_seconds()
        );
        Ok(())
    }
}

/// Start of the 300-second window containing `unix_seconds`, in Windows
/// file-time seconds.
fn window_start_file_time(unix_seconds: f64) -> u64 {
    let file_time = (unix_seconds + WIN_EPOCH as f64).max(0.0).floor() as u64;
    file_time - file_time % TOKEN_WINDOW_SECONDS
}

fn local_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Parse an RFC 2616 date (`Wed, 14 Oct 2026 10:00:00 GMT`).
fn parse_http_date(value: &str) -> Option<f64> {
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    Some(parsed.timestamp() as f64 + f64::from(parsed.timestamp_subsec_millis()) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-10-14 10:00:00 UTC, aligned to a 300 second window
    const WINDOW_START: f64 = 1_791_972_000.0;

    #[test]
    fn test_window_alignment() {
        let start = window_start_file_time(WINDOW_START);
        assert_eq!(start % TOKEN_WINDOW_SECONDS, 0);
        assert_eq!(start, WINDOW_START as u64 + WIN_EPOCH);
        assert_eq!(window_start_file_time(WINDOW_START + 299.9), start);
        assert_eq!(window_start_file_time(WINDOW_START + 300.0), start + 300);
    }

    #[test]
    fn test_token_format() {
        let generator = TokenGenerator::default();
        let token = generator.generate_token_at(WINDOW_START);
        assert_eq!(token.len(), 64);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn test_token_matches_reference_digest() {
        let generator = TokenGenerator::default();
        let ticks = (WINDOW_START as u128 + WIN_EPOCH as u128) * TICKS_PER_SECOND;
        let mut hasher = Sha256::new();
        hasher.update(format!("{}{}", ticks, TRUSTED_CLIENT_TOKEN));
        let expected: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        assert_eq!(generator.generate_token_at(WINDOW_START + 42.5), expected);
    }

    #[test]
    fn test_token_stable_within_window() {
        let generator = TokenGenerator::default();
        let first = generator.generate_token_at(WINDOW_START + 1.0);
        let second = generator.generate_token_at(WINDOW_START + 298.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_token_changes_between_windows() {
        let generator = TokenGenerator::default();
        let current = generator.generate_token_at(WINDOW_START + 299.0);
        let next = generator.generate_token_at(WINDOW_START + 300.0);
        assert_ne!(current, next);
    }

    #[test]
    fn test_skew_correction_shifts_window() {
        let generator = TokenGenerator::default();
        // Server is 10 minutes ahead of the local clock
        generator
            .correct_skew_at(Some("Wed, 14 Oct 2026 10:10:00 GMT"), WINDOW_START)
            .unwrap();
        assert!((generator.clock_skew_seconds() - 600.0).abs() < 1e-6);

        let reference = TokenGenerator::default();
        assert_eq!(
            generator.generate_token_at(WINDOW_START),
            reference.generate_token_at(WINDOW_START + 600.0)
        );
    }

    #[test]
    fn test_skew_corrections_accumulate() {
        let generator = TokenGenerator::default();
        generator.adjust_clock_skew(120.0);
        // Server reports local + 300; the existing 120s is already applied, so
        // only the remaining 180s is added.
        generator
            .correct_skew_at(Some("Wed, 14 Oct 2026 10:05:00 GMT"), WINDOW_START)
            .unwrap();
        assert!((generator.clock_skew_seconds() - 300.0).abs() < 1e-6);

        generator.adjust_clock_skew(-50.0);
        assert!((generator.clock_skew_seconds() - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_skew_correction_requires_date() {
        let generator = TokenGenerator::default();
        let missing = generator.correct_skew_at(None, WINDOW_START);
        assert!(matches!(missing, Err(TTSError::Configuration(_))));

        let garbage = generator.correct_skew_at(Some("yesterday-ish"), WINDOW_START);
        assert!(matches!(garbage, Err(TTSError::Configuration(_))));
        assert_eq!(generator.clock_skew_seconds(), 0.0);
    }

    #[test]
    fn test_custom_client_token_changes_digest() {
        let default = TokenGenerator::default();
        let custom = TokenGenerator::new(SecretString::from("0123456789ABCDEF".to_string()));
        assert_ne!(
            default.generate_token_at(WINDOW_START),
            custom.generate_token_at(WINDOW_START)
        );
    }
}
