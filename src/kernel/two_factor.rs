//! Time-based one-time passwords (RFC 6238, HMAC-SHA1).
//!
//! Secrets are 20 random bytes exchanged as unpadded RFC 4648 base32, the
//! format authenticator apps expect in `otpauth://` URIs.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

type HmacSha1 = Hmac<Sha1>;

/// Length of generated secrets in bytes (160 bits, per RFC 4226).
const SECRET_LEN: usize = 20;

/// RFC 4648 base32 alphabet.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Enrollment artifact handed to the user's authenticator app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    /// Base32 secret for manual entry.
    pub secret: String,
    /// `otpauth://` URI, typically rendered as a QR code.
    pub otpauth_uri: String,
}

/// TOTP generator/verifier with fixed parameters.
#[derive(Debug, Clone)]
pub struct Totp {
    issuer: String,
    digits: u32,
    step_secs: u64,
    skew_steps: u64,
}

impl Totp {
    /// Build from explicit parameters.
    pub fn new(issuer: impl Into<String>, digits: u32, step_secs: u64, skew_steps: u64) -> Self {
        Self {
            issuer: issuer.into(),
            digits,
            step_secs: step_secs.max(1),
            skew_steps,
        }
    }

    /// Build from the `[auth]` config section.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.totp_issuer.clone(),
            config.totp_digits,
            config.totp_step_secs,
            config.totp_skew_steps,
        )
    }

    /// Generate a fresh secret and its provisioning payload for `account_label`.
    pub fn provision(&self, account_label: &str) -> ProvisioningPayload {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        let encoded = base32_encode(&secret);
        let otpauth_uri = format!(
            "otpauth://totp/{issuer}:{label}?secret={encoded}&issuer={issuer}&digits={digits}&period={period}",
            issuer = urlencoding::encode(&self.issuer),
            label = urlencoding::encode(account_label),
            digits = self.digits,
            period = self.step_secs,
        );
        ProvisioningPayload {
            secret: encoded,
            otpauth_uri,
        }
    }

    /// The code valid at `at` for a base32 secret.
    pub fn code_at(&self, secret_b32: &str, at: DateTime<Utc>) -> Option<String> {
        let secret = base32_decode(secret_b32)?;
        let counter = self.counter_at(at)?;
        hotp(&secret, counter, self.digits)
    }

    /// Whether `code` matches any step within the configured skew of `at`.
    pub fn verify(&self, secret_b32: &str, code: &str, at: DateTime<Utc>) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let Some(secret) = base32_decode(secret_b32) else {
            return false;
        };
        let Some(current) = self.counter_at(at) else {
            return false;
        };

        let first = current.saturating_sub(self.skew_steps);
        let last = current.saturating_add(self.skew_steps);
        let mut matched = false;
        for counter in first..=last {
            if let Some(expected) = hotp(&secret, counter, self.digits) {
                matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
            }
        }
        matched
    }

    fn counter_at(&self, at: DateTime<Utc>) -> Option<u64> {
        let secs = u64::try_from(at.timestamp()).ok()?;
        secs.checked_div(self.step_secs)
    }
}

/// HOTP value (RFC 4226) for `counter`, zero-padded to `digits`.
fn hotp(secret: &[u8], counter: u64, digits: u32) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let offset = usize::from(hash.last()? & 0x0f);
    let window = hash.get(offset..offset.checked_add(4)?)?;
    let binary = u32::from_be_bytes([window[0] & 0x7f, window[1], window[2], window[3]]);
    let modulus = 10u32.checked_pow(digits)?;
    let value = binary.checked_rem(modulus)?;
    Some(format!("{value:0width$}", width = digits as usize))
}

/// Unpadded RFC 4648 base32.
pub fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().saturating_mul(8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = buffer.wrapping_shl(8) | u32::from(byte);
        bits = bits.saturating_add(8);
        while bits >= 5 {
            bits = bits.saturating_sub(5);
            let index = (buffer.wrapping_shr(bits) & 0x1f) as usize;
            out.push(char::from(BASE32_ALPHABET[index]));
        }
        buffer &= low_bits_mask(bits);
    }
    if bits > 0 {
        let index = (buffer.wrapping_shl(5u32.saturating_sub(bits)) & 0x1f) as usize;
        out.push(char::from(BASE32_ALPHABET[index]));
    }
    out
}

/// Mask keeping the lowest `bits` bits (`bits` < 32 in the base32 helpers).
fn low_bits_mask(bits: u32) -> u32 {
    1u32.checked_shl(bits).map_or(u32::MAX, |bit| bit.wrapping_sub(1))
}

/// Decode base32, ignoring case, spaces and `=` padding.
pub fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len().saturating_mul(5).div_ceil(8));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for ch in input.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let upper = ch.to_ascii_uppercase();
        let value = BASE32_ALPHABET.iter().position(|&a| char::from(a) == upper)?;
        buffer = buffer.wrapping_shl(5) | u32::try_from(value).ok()?;
        bits = bits.saturating_add(5);
        if bits >= 8 {
            bits = bits.saturating_sub(8);
            out.push(u8::try_from(buffer.wrapping_shr(bits) & 0xff).ok()?);
        }
        buffer &= low_bits_mask(bits);
    }
    Some(out)
}
