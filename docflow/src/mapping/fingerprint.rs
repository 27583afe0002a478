//! Deterministic fingerprints of (profile, header shape).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Canonicalizes a column header.
///
/// Removes line breaks, tabs, whitespace, parentheses (ASCII and
/// full-width) and quotes, so cosmetic variants of one header collapse.
#[must_use]
pub fn canonicalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| {
            !c.is_whitespace()
                && !matches!(c, '(' | ')' | '（' | '）' | '"' | '\'' | '“' | '”' | '‘' | '’')
        })
        .collect()
}

/// Canonicalizes every header, keeping order.
#[must_use]
pub fn canonicalize_headers<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
    headers.iter().map(|h| canonicalize_header(h.as_ref())).collect()
}

/// A 128-bit content address, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints a header list under a profile.
    ///
    /// Headers must already be canonical. Order matters; each header is
    /// length-prefixed so boundaries cannot be forged by concatenation.
    #[must_use]
    pub fn compute<S: AsRef<str>>(profile_id: i64, headers: &[S]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"docflow.mapping.v1\0");
        hasher.update(profile_id.to_be_bytes());
        hasher.update((headers.len() as u64).to_be_bytes());
        for header in headers {
            let bytes = header.as_ref().as_bytes();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Canonicalizes raw headers, then fingerprints them.
    #[must_use]
    pub fn of_raw_headers<S: AsRef<str>>(profile_id: i64, headers: &[S]) -> Self {
        Self::compute(profile_id, &canonicalize_headers(headers))
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
