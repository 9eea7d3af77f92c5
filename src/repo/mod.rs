// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable-store contract consumed by the services. The engine only ever
//! talks to these traits; `memory` is the reference realization and the test
//! substrate. Row layout and indexing are a backend concern — entities cross
//! this boundary whole.

pub mod memory;

use std::time::Duration;

use cid::Cid;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Address, AddressInfo, AddressState, FeeConfig, ChainEpoch, Message, MessageReceipt,
    MessageState, Node, SharedParams, TokenAmount, Wallet, WalletAddress,
};

#[derive(Debug, PartialEq, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Error::AlreadyExists(what.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait MessageRepo {
    /// Insert or overwrite a message by id.
    fn save_message(&self, msg: &Message) -> Result<()>;
    fn batch_save_message(&self, msgs: &[Message]) -> Result<()>;
    fn has_message_by_id(&self, id: &Uuid) -> Result<bool>;
    fn get_message_by_id(&self, id: &Uuid) -> Result<Message>;
    fn get_message_by_unsigned_cid(&self, cid: &Cid) -> Result<Message>;
    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message>;
    fn get_message_by_from_and_nonce(&self, from: &Address, nonce: u64) -> Result<Message>;
    /// Signed messages recorded on chain at the given height.
    fn get_signed_messages_by_height(&self, height: ChainEpoch) -> Result<Vec<Message>>;
    fn list_message(&self) -> Result<Vec<Message>>;
    fn list_message_by_address(&self, addr: &Address) -> Result<Vec<Message>>;
    /// Paged listing; `page_index` is 1-based, ordered by creation time.
    fn list_message_by_from_state(
        &self,
        from: &Address,
        state: MessageState,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>>;
    fn list_unfilled_message(&self, addr: &Address) -> Result<Vec<Message>>;
    fn list_filled_message(&self, addr: &Address) -> Result<Vec<Message>>;
    fn list_all_filled_message(&self) -> Result<Vec<Message>>;
    /// Unfilled candidates ordered by expire epoch ascending, zero sorting
    /// last, capped at `limit`.
    fn list_unchain_message_by_address(&self, addr: &Address, limit: usize)
        -> Result<Vec<Message>>;
    /// Filled messages whose last update is older than `older_than`.
    fn list_blocked_message(&self, addr: &Address, older_than: Duration) -> Result<Vec<Message>>;
    fn list_failed_message(&self) -> Result<Vec<Message>>;
    fn update_message_state_by_id(&self, id: &Uuid, state: MessageState) -> Result<()>;
    fn update_message_state_by_cid(&self, signed_cid: &Cid, state: MessageState) -> Result<()>;
    /// Persist the outcome of signing: nonce, gas, signature, cids, state.
    fn update_signed_message_by_id(&self, msg: &Message) -> Result<()>;
    /// Receipt and height of an on-chain inclusion (or their clearing on
    /// revert).
    fn update_message_receipt(
        &self,
        signed_cid: &Cid,
        receipt: Option<MessageReceipt>,
        height: ChainEpoch,
        state: MessageState,
    ) -> Result<()>;
    fn update_message_error(&self, id: &Uuid, error: &str) -> Result<()>;
    fn mark_bad_message(&self, id: &Uuid) -> Result<()>;
    /// Persist a batch of terminally expired/failed messages, each record
    /// carrying its own terminal state.
    fn expire_messages(&self, msgs: &[Message]) -> Result<()>;
}

pub trait AddressRepo {
    fn save_address(&self, info: &AddressInfo) -> Result<()>;
    fn get_address(&self, addr: &Address) -> Result<AddressInfo>;
    fn get_address_by_id(&self, id: &Uuid) -> Result<AddressInfo>;
    fn has_address(&self, addr: &Address) -> Result<bool>;
    fn list_address(&self) -> Result<Vec<AddressInfo>>;
    fn update_nonce(&self, addr: &Address, nonce: u64) -> Result<()>;
    fn update_state(&self, addr: &Address, state: AddressState) -> Result<()>;
    fn update_select_msg_num(&self, addr: &Address, num: u64) -> Result<()>;
    fn update_fee_params(
        &self,
        addr: &Address,
        gas_over_estimation: f64,
        max_fee: TokenAmount,
        max_fee_cap: TokenAmount,
    ) -> Result<()>;
    fn del_address(&self, addr: &Address) -> Result<()>;
}

pub trait WalletAddressRepo {
    fn save_wallet_address(&self, wa: &WalletAddress) -> Result<()>;
    fn get_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<WalletAddress>;
    fn list_wallet_address(&self) -> Result<Vec<WalletAddress>>;
    fn list_by_addr_id(&self, addr_id: &Uuid) -> Result<Vec<WalletAddress>>;
    fn update_address_state(
        &self,
        wallet_name: &str,
        addr_id: &Uuid,
        state: AddressState,
    ) -> Result<()>;
    fn update_select_msg_num(&self, wallet_name: &str, addr_id: &Uuid, num: u64) -> Result<()>;
    fn del_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<()>;
}

pub trait WalletRepo {
    fn save_wallet(&self, wallet: &Wallet) -> Result<()>;
    fn get_wallet_by_name(&self, name: &str) -> Result<Wallet>;
    fn has_wallet(&self, name: &str) -> Result<bool>;
    fn list_wallet(&self) -> Result<Vec<Wallet>>;
    fn del_wallet(&self, name: &str) -> Result<()>;
}

pub trait NodeRepo {
    fn save_node(&self, node: &Node) -> Result<()>;
    fn get_node(&self, name: &str) -> Result<Node>;
    fn has_node(&self, name: &str) -> Result<bool>;
    fn list_node(&self) -> Result<Vec<Node>>;
    fn del_node(&self, name: &str) -> Result<()>;
}

pub trait FeeConfigRepo {
    fn save_fee_config(&self, cfg: &FeeConfig) -> Result<()>;
    fn get_fee_config(&self, wallet_id: &Uuid, method: u64) -> Result<FeeConfig>;
    fn list_fee_config(&self) -> Result<Vec<FeeConfig>>;
    fn del_fee_config(&self, id: &Uuid) -> Result<()>;
}

pub trait SharedParamsRepo {
    fn get_shared_params(&self) -> Result<Option<SharedParams>>;
    fn set_shared_params(&self, params: &SharedParams) -> Result<()>;
}

/// Closure run against a transactional view. Commit on `Ok`, roll back on
/// `Err`.
pub type TxFn<'a> = &'a mut dyn FnMut(&dyn Repo) -> Result<()>;

/// The full store handed to services. Individual repositories are accessed
/// through the narrow traits so services declare exactly what they touch.
pub trait Repo: Send + Sync {
    fn message_repo(&self) -> &dyn MessageRepo;
    fn address_repo(&self) -> &dyn AddressRepo;
    fn wallet_address_repo(&self) -> &dyn WalletAddressRepo;
    fn wallet_repo(&self) -> &dyn WalletRepo;
    fn node_repo(&self) -> &dyn NodeRepo;
    fn fee_config_repo(&self) -> &dyn FeeConfigRepo;
    fn shared_params_repo(&self) -> &dyn SharedParamsRepo;

    /// Run `f` against a scoped view of the store. All writes performed by
    /// `f` become visible atomically on `Ok`; an `Err` discards them.
    /// Transactions serialize against each other.
    fn transaction(&self, f: TxFn<'_>) -> Result<()>;
}
