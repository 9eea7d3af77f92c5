// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Network prefixes accepted for an address string.
const NETWORK_PREFIXES: [char; 2] = ['f', 't'];

#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("address is too short")]
    TooShort,
    #[error("unknown network prefix `{0}`")]
    UnknownNetwork(char),
    #[error("unknown address protocol `{0}`")]
    UnknownProtocol(char),
    #[error("invalid payload character `{0}`")]
    InvalidPayload(char),
}

/// A chain address in its canonical string form.
///
/// The messager never resolves or transforms addresses itself; it forwards
/// them to the node and wallet endpoints verbatim. Validation is therefore
/// limited to the textual envelope: network prefix, protocol digit, and a
/// base32/decimal payload.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

impl Address {
    pub fn new(s: &str) -> Result<Self, Error> {
        let mut chars = s.chars();
        let network = chars.next().ok_or(Error::TooShort)?;
        if !NETWORK_PREFIXES.contains(&network) {
            return Err(Error::UnknownNetwork(network));
        }
        let protocol = chars.next().ok_or(Error::TooShort)?;
        if !('0'..='4').contains(&protocol) {
            return Err(Error::UnknownProtocol(protocol));
        }
        let mut payload = chars.peekable();
        if payload.peek().is_none() {
            return Err(Error::TooShort);
        }
        for c in payload {
            if !(c.is_ascii_lowercase() || c.is_ascii_digit()) {
                return Err(Error::InvalidPayload(c));
            }
        }
        Ok(Address(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The zero id-address; used where derives need a placeholder, never valid as
// a managed sender.
impl Default for Address {
    fn default() -> Self {
        Address("f00".to_owned())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_id_and_key_addresses() {
        assert!(Address::new("f01234").is_ok());
        assert!(Address::new("t3wukog2rsnbqtsuv2dzjxnn6j4dwzyvillklycqssjevigr3gficmbrzh2nghnmn2yhqjkvnl2jqm6y6o3q").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Address::new("x0123"), Err(Error::UnknownNetwork('x')));
        assert_eq!(Address::new("f91"), Err(Error::UnknownProtocol('9')));
        assert_eq!(Address::new("f0"), Err(Error::TooShort));
        assert_eq!(Address::new("f0ABC"), Err(Error::InvalidPayload('A')));
    }
}
