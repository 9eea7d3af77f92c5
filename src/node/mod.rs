// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Read/push view of a chain node. The engine and selector are written
//! against [`NodeApi`]; `rpc` dials a real node over JSON-RPC and `test_api`
//! is the in-crate mock.

pub mod rpc;
pub mod test_api;

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{
    Address, BlockHeader, ChainEpoch, MessageReceipt, SignedMessage, Tipset, TipsetKeys,
    TokenAmount, UnsignedMessage,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("node api: {0}")]
    Api(String),
    #[error("actor {0} not found")]
    ActorNotFound(Address),
    #[error("timed out on {0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Actor state as reported by the node at some tipset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub nonce: u64,
    pub balance: TokenAmount,
}

/// One element of a chain-notify delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HeadChange {
    /// Snapshot of the head at subscription time.
    Current(Tipset),
    Apply(Tipset),
    Revert(Tipset),
}

/// Messages carried by a single block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMessages {
    pub bls_messages: Vec<UnsignedMessage>,
    pub secp_messages: Vec<SignedMessage>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSendSpec {
    pub max_fee: TokenAmount,
    pub gas_over_estimation: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateMessage {
    pub msg: UnsignedMessage,
    pub spec: MessageSendSpec,
}

/// Per-message outcome of a batch estimation. `err` is the node's error
/// string; empty means the estimate succeeded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateResult {
    pub msg: UnsignedMessage,
    pub err: String,
}

/// Result of a message search: where the message landed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgLookup {
    pub message: Cid,
    pub receipt: MessageReceipt,
    pub tipset: TipsetKeys,
    pub height: ChainEpoch,
}

/// Dials a node record into a usable client. Seam for tests and for
/// alternative transports.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, node: &crate::types::Node) -> Result<std::sync::Arc<dyn NodeApi>>;
}

/// Connector producing JSON-RPC node clients.
pub struct RpcNodeConnector;

#[async_trait]
impl NodeConnector for RpcNodeConnector {
    async fn connect(&self, node: &crate::types::Node) -> Result<std::sync::Arc<dyn NodeApi>> {
        Ok(std::sync::Arc::new(
            rpc::RpcNode::connect(&node.url, &node.token).await?,
        ))
    }
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Subscribe to head changes. Deliveries arrive in batches and preserve
    /// chain order; a reconnecting implementation starts a fresh stream
    /// rather than resuming, so consumers must reconcile on resubscribe.
    async fn chain_notify(&self) -> Result<mpsc::Receiver<Vec<HeadChange>>>;
    async fn chain_head(&self) -> Result<Tipset>;
    async fn chain_get_tipset(&self, key: &TipsetKeys) -> Result<Tipset>;
    async fn chain_get_block(&self, cid: &Cid) -> Result<BlockHeader>;
    async fn chain_get_block_messages(&self, blk: &Cid) -> Result<BlockMessages>;
    /// Messages executed by the block, i.e. the messages of its parent
    /// tipset, paired with their cids.
    async fn chain_get_parent_messages(&self, blk: &Cid)
        -> Result<Vec<(Cid, UnsignedMessage)>>;
    /// Receipts for the block's parent messages, in the same order.
    async fn chain_get_parent_receipts(&self, blk: &Cid) -> Result<Vec<MessageReceipt>>;
    async fn state_account_key(&self, addr: &Address, key: &TipsetKeys) -> Result<Address>;
    async fn state_search_msg(&self, cid: &Cid) -> Result<Option<MsgLookup>>;
    async fn state_get_actor(&self, addr: &Address, key: &TipsetKeys) -> Result<Actor>;
    async fn gas_estimate_message_gas(
        &self,
        msg: &UnsignedMessage,
        spec: &MessageSendSpec,
        key: &TipsetKeys,
    ) -> Result<UnsignedMessage>;
    async fn gas_estimate_fee_cap(
        &self,
        msg: &UnsignedMessage,
        max_queue_blocks: i64,
        key: &TipsetKeys,
    ) -> Result<TokenAmount>;
    async fn gas_estimate_gas_premium(
        &self,
        nblocksincl: u64,
        sender: &Address,
        gas_limit: i64,
        key: &TipsetKeys,
    ) -> Result<TokenAmount>;
    async fn gas_estimate_gas_limit(
        &self,
        msg: &UnsignedMessage,
        key: &TipsetKeys,
    ) -> Result<i64>;
    /// Estimate a run of messages from one sender assuming nonces start at
    /// `from_nonce`. Per-message failures are reported in-band.
    async fn gas_batch_estimate_message_gas(
        &self,
        msgs: &[EstimateMessage],
        from_nonce: u64,
        key: &TipsetKeys,
    ) -> Result<Vec<EstimateResult>>;
    async fn mpool_push(&self, msg: &SignedMessage) -> Result<Cid>;
    async fn mpool_batch_push(&self, msgs: &[SignedMessage]) -> Result<Vec<Cid>>;
    async fn mpool_publish_by_addr(&self, addr: &Address) -> Result<()>;
    async fn mpool_publish_message(&self, msg: &SignedMessage) -> Result<()>;
}
