// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message-lifecycle engine and its supporting services.

pub mod address_service;
pub mod message_service;
pub mod message_state;
pub mod node_service;
pub mod selector;
pub mod shared_params;
pub mod tipset_cache;
pub mod wallet_service;

use thiserror::Error;
use uuid::Uuid;

use crate::types::Address;

pub use address_service::AddressService;
pub use message_service::{MessageService, MessageServiceConfig};
pub use message_state::MessageStateCache;
pub use node_service::NodeService;
pub use selector::{MessageSelector, SelectResult};
pub use shared_params::SharedParamsService;
pub use tipset_cache::{TipsetCache, TipsetRecord};
pub use wallet_service::WalletService;

#[derive(Debug, Error)]
pub enum Error {
    #[error("address {0} not exists")]
    AddressNotExists(Address),
    #[error("address {0} is forbidden")]
    AddressForbidden(Address),
    #[error("message id {0} already exists")]
    DuplicateId(Uuid),
    #[error("unknown message {0}")]
    UnknownMessage(Uuid),
    #[error("target nonce {target} smaller than chain nonce {chain}")]
    InvalidTarget { target: u64, chain: u64 },
    #[error("reorg deeper than {0} blocks, manual intervention required")]
    TooDeepReorg(usize),
    #[error("message {0} is in state {1:?}, operation not applicable")]
    InvalidMessageState(Uuid, crate::types::MessageState),
    #[error(transparent)]
    Repo(#[from] crate::repo::Error),
    #[error(transparent)]
    Node(#[from] crate::node::Error),
    #[error(transparent)]
    Wallet(#[from] crate::wallet::Error),
    #[error(transparent)]
    TipsetFile(#[from] tipset_cache::Error),
    #[error("{0}")]
    Encoding(String),
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
