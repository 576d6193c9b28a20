//! Canonical field encoding and HMAC-SHA256 signatures.
//!
//! Every signed record is first flattened into [`SignedFields`], a sorted
//! multimap of string keys to byte values. The encoding sorts keys, keeps
//! values for one key in insertion order, and percent-escapes every byte
//! outside `[A-Za-z0-9._~-]`, so map iteration order and locale never reach
//! the digest.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Signature verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The supplied signature is not valid base64.
    #[error("signature is not valid base64")]
    Malformed,
    /// The supplied signature does not match the computed one.
    #[error("{0} signature mismatch")]
    Mismatch(&'static str),
}

/// Sorted multimap of canonical fields awaiting a signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedFields {
    fields: BTreeMap<String, Vec<Vec<u8>>>,
}

impl SignedFields {
    /// Create an empty field set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl AsRef<[u8]>) {
        self.fields
            .entry(key.into())
            .or_default()
            .push(value.as_ref().to_vec());
    }

    /// Append every value under `key`, preserving order.
    pub fn add_all<I, V>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let entry = self.fields.entry(key.into()).or_default();
        entry.extend(values.into_iter().map(|v| v.as_ref().to_vec()));
    }

    /// Append a timestamp rounded to whole seconds in RFC 3339 UTC form.
    pub fn add_time(&mut self, key: impl Into<String>, time: &DateTime<Utc>) {
        self.add(key, canonical_time(time));
    }

    /// Render the canonical `key=value&key=value` byte string.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (key, values) in &self.fields {
            let prefix = escape(key.as_bytes());
            for value in values {
                if !out.is_empty() {
                    out.push('&');
                }
                out.push_str(&prefix);
                out.push('=');
                out.push_str(&escape(value));
            }
        }
        out
    }

    /// Sign the encoded fields, returning a base64 HMAC-SHA256 digest.
    pub fn sign(&self, secret: &[u8]) -> String {
        let mac = self.mac(secret);
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Verify `signature` against the encoded fields in constant time.
    pub fn verify(
        &self,
        secret: &[u8],
        signature: &str,
        what: &'static str,
    ) -> Result<(), SignatureError> {
        let expected = STANDARD
            .decode(signature.trim())
            .map_err(|_| SignatureError::Malformed)?;
        self.mac(secret)
            .verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch(what))
    }

    fn mac(&self, secret: &[u8]) -> Hmac<Sha256> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length");
        mac.update(self.encode().as_bytes());
        mac
    }
}

/// Percent-escape every byte outside the unreserved set, using uppercase hex.
pub fn escape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Round to whole seconds and format as RFC 3339 with a `Z` suffix.
pub fn canonical_time(time: &DateTime<Utc>) -> String {
    time.round_subsecs(0)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}
