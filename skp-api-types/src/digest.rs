use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Length of a rendered digest (64 lowercase hex characters).
pub const DIGEST_HEX_LEN: usize = 64;

/// 32-byte BLAKE3 digest, the sole name for chunks.
///
/// Equality and ordering are byte-wise. Rendered as 64 lowercase hex
/// characters everywhere (logs, catalog rows, blob file names).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Digest {
    #[serde(with = "hex::serde")]
    bytes: [u8; 32],
}

impl Digest {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl std::str::FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Digest::new(bytes))
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Digest::new(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_hex_roundtrip() {
        let digest = Digest::new([0xab; 32]);
        let hex = digest.to_hex();
        assert_eq!(hex.len(), DIGEST_HEX_LEN);
        assert_eq!(hex, "ab".repeat(32));
        assert_eq!(hex.parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn digest_rejects_bad_hex() {
        assert!("abcd".parse::<Digest>().is_err());
        assert!("zz".repeat(32).parse::<Digest>().is_err());
    }

    #[test]
    fn digest_serde_is_hex_string() {
        let digest = Digest::new([0x01; 32]);
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn digest_order_is_byte_wise() {
        let a = Digest::new([0x00; 32]);
        let b = Digest::new([0x01; 32]);
        assert!(a < b);
    }
}
