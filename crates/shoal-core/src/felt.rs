//! 250-bit field element

use crate::error::{CoreError, Result};
use crate::FELT_BITS;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// bits of the most significant byte that survive masking
const TOP_BYTE_MASK: u8 = 0xff >> (256 - FELT_BITS);

/// field element shared by the ledger and the circuit
///
/// stored big-endian. the constructor that takes raw bytes rejects values
/// with any of the top `256 - FELT_BITS` bits set; hash outputs go through
/// [`Felt::from_bytes_masked`] instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Felt([u8; 32]);

impl Felt {
    pub const ZERO: Felt = Felt([0u8; 32]);

    /// checked constructor
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        if bytes[0] & !TOP_BYTE_MASK != 0 {
            return Err(CoreError::OutOfRange(format!("0x{}", hex::encode(bytes))));
        }
        Ok(Self(bytes))
    }

    /// truncate to FELT_BITS, never fails
    pub fn from_bytes_masked(mut bytes: [u8; 32]) -> Self {
        bytes[0] &= TOP_BYTE_MASK;
        Self(bytes)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_u128(value as u128)
    }

    pub fn from_u128(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[16..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// parse `0x`-prefixed (or bare) hex, up to 64 digits, left-padded
    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(hex_to_bytes(s)?)
    }

    /// parse hex and truncate to FELT_BITS, for full-width ledger values
    /// such as transaction hashes
    pub fn from_hex_masked(s: &str) -> Result<Self> {
        Ok(Self::from_bytes_masked(hex_to_bytes(s)?))
    }

    /// `0x` followed by 64 lowercase hex digits
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// value as u64 if it fits
    pub fn to_u64(&self) -> Option<u64> {
        if self.0[..24].iter().any(|b| *b != 0) {
            return None;
        }
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[24..]);
        Some(u64::from_be_bytes(tail))
    }
}

fn hex_to_bytes(s: &str) -> Result<[u8; 32]> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if digits.is_empty() || digits.len() > 64 {
        return Err(CoreError::InvalidHex(s.to_string()));
    }
    let padded = format!("{:0>64}", digits);
    let decoded = hex::decode(&padded).map_err(|e| CoreError::InvalidHex(format!("{}: {}", s, e)))?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

impl AsRef<[u8]> for Felt {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Felt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Felt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Felt({})", self.to_hex())
    }
}

impl std::str::FromStr for Felt {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Felt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Felt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Felt::from_hex(&s).map_err(de::Error::custom)
    }
}
