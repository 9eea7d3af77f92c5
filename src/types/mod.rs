// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod address;
pub mod econ;
pub mod message;
pub mod tipset;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use address::Address;
pub use econ::TokenAmount;
pub use message::{
    Message, MessageReceipt, MessageState, MsgMeta, Signature, SignatureType, SignedMessage,
    UnsignedMessage,
};
pub use tipset::{BlockHeader, Tipset, TipsetKeys};

/// Chain height. Negative values never occur in practice but the signed type
/// matches the chain's epoch arithmetic.
pub type ChainEpoch = i64;

/// Method selector of an unsigned message.
pub type MethodNum = u64;

/// Lifecycle state of a managed sender or of a wallet↔address binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressState {
    /// Selectable: may sign and push new messages.
    Alive,
    /// Already-signed messages keep flowing; no new signatures.
    Forbidden,
    /// Unmanaged; hidden from selection entirely.
    Removed,
}

/// A managed sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub id: Uuid,
    pub addr: Address,
    /// Next nonce to assign locally. Invariant: never behind the chain actor
    /// nonce once the selector has run against a healthy node.
    pub nonce: u64,
    /// Selection order among addresses; lower weight selects first.
    pub weight: i64,
    /// Per-address in-flight cap; 0 falls back to the shared parameter.
    pub sel_msg_num: u64,
    pub gas_over_estimation: f64,
    pub max_fee: TokenAmount,
    pub max_fee_cap: TokenAmount,
    pub state: AddressState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressInfo {
    pub fn new(addr: Address) -> Self {
        let now = Utc::now();
        AddressInfo {
            id: Uuid::new_v4(),
            addr,
            nonce: 0,
            weight: 0,
            sel_msg_num: 0,
            gas_over_estimation: 0.0,
            max_fee: TokenAmount::default(),
            max_fee_cap: TokenAmount::default(),
            state: AddressState::Alive,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Binding of a wallet endpoint to a managed address: which wallet signs for
/// the address and whether signing is currently permitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub id: Uuid,
    pub wallet_name: String,
    pub addr_id: Uuid,
    pub addr_state: AddressState,
    /// Per-binding in-flight cap; 0 falls back to the address, then global.
    pub sel_msg_num: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAddress {
    pub fn new(wallet_name: String, addr_id: Uuid) -> Self {
        let now = Utc::now();
        WalletAddress {
            id: Uuid::new_v4(),
            wallet_name,
            addr_id,
            addr_state: AddressState::Alive,
            sel_msg_num: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A remote wallet endpoint capable of signing for bound addresses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A secondary chain-node endpoint kept for operator redundancy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fee policy override scoped to a wallet and method selector; CRUD-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub method: MethodNum,
    pub gas_over_estimation: f64,
    pub max_fee: TokenAmount,
    pub max_fee_cap: TokenAmount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Globally effective policy. A single record, cached in memory and refreshed
/// on update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedParams {
    /// Default message expiry; 0 means no expiry unless set per message.
    pub expire_epoch: ChainEpoch,
    /// Multiplier applied to the estimated gas limit.
    pub gas_over_estimation: f64,
    /// Hard cap on `gas_fee_cap · gas_limit`; zero disables the cap.
    pub max_fee: TokenAmount,
    /// Default ceiling for the per-unit fee.
    pub max_fee_cap: TokenAmount,
    /// Default per-address cap on signed-but-not-yet-onchain messages.
    pub sel_msg_num: u64,
    /// Push-loop tick period.
    pub scan_interval: Duration,
    /// Estimation-failure strikes before a message goes `Failed`.
    pub max_est_fail_num_of_msg: u64,
}

impl Default for SharedParams {
    fn default() -> Self {
        SharedParams {
            expire_epoch: 0,
            gas_over_estimation: 1.25,
            max_fee: TokenAmount::default(),
            max_fee_cap: TokenAmount::default(),
            sel_msg_num: 20,
            scan_interval: Duration::from_secs(10),
            max_est_fail_num_of_msg: 5,
        }
    }
}

impl SharedParams {
    /// The global defaults viewed as a message meta, for per-message
    /// defaulting.
    pub fn msg_meta(&self) -> MsgMeta {
        MsgMeta {
            expire_epoch: self.expire_epoch,
            gas_over_estimation: self.gas_over_estimation,
            max_fee: self.max_fee.clone(),
            max_fee_cap: self.max_fee_cap.clone(),
        }
    }
}

/// Confirmation depth at which an on-chain message is stable enough to leave
/// the hot cache.
pub const SAFE_PACK_HEIGHT: ChainEpoch = 100;
