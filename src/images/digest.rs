//! Content digests in `algorithm:hex` form. Only sha256 is produced; the
//! hex portion doubles as the filesystem-safe blob key.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wraps a raw hex string, prefixing `sha256:`.
    pub fn from_hex(hex: &str) -> Self {
        Self(format!("sha256:{hex}"))
    }

    /// Accepts an already-prefixed digest string.
    pub fn parse(s: &str) -> Self {
        if s.contains(':') {
            Self(s.to_string())
        } else {
            Self::from_hex(s)
        }
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hex(&hex::encode(Sha256::digest(data)))
    }

    /// Hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips an optional `sha256:` prefix so prefix-length checks count hex
/// digits, not the algorithm tag.
pub fn strip_algo(s: &str) -> &str {
    s.strip_prefix("sha256:").unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let d = Digest::from_hex("ab12");
        assert_eq!(d.as_str(), "sha256:ab12");
        assert_eq!(d.hex(), "ab12");
        assert_eq!(Digest::parse("sha256:ab12"), d);
        assert_eq!(Digest::parse("ab12"), d);
    }

    #[test]
    fn of_bytes_matches_known_vector() {
        // sha256 of the empty string.
        assert_eq!(
            Digest::of_bytes(b"").hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn strip_algo_only_removes_prefix() {
        assert_eq!(strip_algo("sha256:abcd"), "abcd");
        assert_eq!(strip_algo("abcd"), "abcd");
    }
}
