// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A quantity of attoFIL. Arithmetic is arbitrary precision; the value is
/// serialized as a decimal string so it survives JSON and storage backends
/// that cannot hold 128+ bit integers.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(BigInt);

impl TokenAmount {
    pub fn from_atto(atto: impl Into<BigInt>) -> Self {
        TokenAmount(atto.into())
    }

    pub fn atto(&self) -> &BigInt {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The smaller of two amounts, by value.
    pub fn min(a: Self, b: Self) -> Self {
        if a <= b {
            a
        } else {
            b
        }
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TokenAmount(BigInt::from_str(s)?))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Add for TokenAmount {
    type Output = TokenAmount;
    fn add(self, rhs: Self) -> Self::Output {
        TokenAmount(self.0 + rhs.0)
    }
}

impl AddAssign for TokenAmount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for TokenAmount {
    type Output = TokenAmount;
    fn sub(self, rhs: Self) -> Self::Output {
        TokenAmount(self.0 - rhs.0)
    }
}

impl Mul<i64> for &TokenAmount {
    type Output = TokenAmount;
    fn mul(self, rhs: i64) -> TokenAmount {
        TokenAmount(self.0.clone() * BigInt::from(rhs))
    }
}

impl Mul<u64> for &TokenAmount {
    type Output = TokenAmount;
    fn mul(self, rhs: u64) -> TokenAmount {
        TokenAmount(self.0.clone() * BigInt::from(rhs))
    }
}

impl Div<i64> for &TokenAmount {
    type Output = TokenAmount;
    fn div(self, rhs: i64) -> TokenAmount {
        TokenAmount(self.0.clone() / BigInt::from(rhs))
    }
}

impl Div<u64> for &TokenAmount {
    type Output = TokenAmount;
    fn div(self, rhs: u64) -> TokenAmount {
        TokenAmount(self.0.clone() / BigInt::from(rhs))
    }
}
