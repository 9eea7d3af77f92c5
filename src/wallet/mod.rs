// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Signing capability consumed by the selector. Local keystores and remote
//! gateways are just different providers of the same two calls.

pub mod rpc;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, Signature, Wallet};

#[derive(Debug, Error)]
pub enum Error {
    #[error("wallet api: {0}")]
    Api(String),
    #[error("wallet refused to sign: {0}")]
    Signing(String),
    #[error("timed out on {0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the payload handed to `wallet_sign` is. Wallets gate their policy on
/// this; `extra` carries the serialized message for independent inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SignType {
    ChainMsg,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignMeta {
    pub sign_type: SignType,
    pub extra: Vec<u8>,
}

#[async_trait]
pub trait WalletApi: Send + Sync {
    /// Whether `account` holds the key for `addr` on this wallet.
    async fn wallet_has(&self, account: &str, addr: &Address) -> Result<bool>;
    /// Sign `to_sign` with the key for `addr`, under the named account.
    async fn wallet_sign(
        &self,
        account: &str,
        addr: &Address,
        to_sign: &[u8],
        meta: &SignMeta,
    ) -> Result<Signature>;
}

/// Dials a wallet record into a usable client. Seam for tests and for
/// alternative transports.
pub trait WalletConnector: Send + Sync {
    fn connect(&self, wallet: &Wallet) -> Result<Arc<dyn WalletApi>>;
}

/// Connector producing JSON-RPC gateway clients.
pub struct RpcWalletConnector;

impl WalletConnector for RpcWalletConnector {
    fn connect(&self, wallet: &Wallet) -> Result<Arc<dyn WalletApi>> {
        Ok(Arc::new(rpc::RpcWallet::connect(&wallet.url, &wallet.token)?))
    }
}
