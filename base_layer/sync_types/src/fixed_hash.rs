// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    convert::TryFrom,
    fmt::{Display, Formatter},
    ops::Deref,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ZERO_HASH: [u8; FixedHash::byte_size()] = [0u8; FixedHash::byte_size()];

#[derive(Debug, Error)]
#[error("Invalid size")]
pub struct FixedHashSizeError;

/// A 32-byte hash value
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixedHash([u8; FixedHash::byte_size()]);

impl FixedHash {
    pub const fn byte_size() -> usize {
        32
    }

    pub const fn zero() -> Self {
        Self(ZERO_HASH)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == ZERO_HASH
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; FixedHash::byte_size()]> for FixedHash {
    fn from(hash: [u8; FixedHash::byte_size()]) -> Self {
        Self(hash)
    }
}

impl TryFrom<&[u8]> for FixedHash {
    type Error = FixedHashSizeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != FixedHash::byte_size() {
            return Err(FixedHashSizeError);
        }
        let mut buf = [0u8; FixedHash::byte_size()];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl Deref for FixedHash {
    type Target = [u8; FixedHash::byte_size()];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for FixedHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for FixedHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FixedHash({})", self.to_hex())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_rejects_wrong_sized_slices() {
        assert!(FixedHash::try_from(&[1u8; 31][..]).is_err());
        assert!(FixedHash::try_from(&[1u8; 33][..]).is_err());
        let hash = FixedHash::try_from(&[1u8; 32][..]).unwrap();
        assert_eq!(hash.as_slice(), &[1u8; 32]);
    }

    #[test]
    fn it_displays_as_hex() {
        let hash = FixedHash::from([0xab; 32]);
        assert_eq!(hash.to_string(), "ab".repeat(32));
        assert!(FixedHash::zero().is_zero());
        assert!(!hash.is_zero());
    }
}
