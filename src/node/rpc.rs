// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! JSON-RPC realization of [`NodeApi`] against a live node, including the
//! `ChainNotify` subscription pump.

use async_trait::async_trait;
use cid::Cid;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    Actor, BlockMessages, Error, EstimateMessage, EstimateResult, HeadChange, MessageSendSpec,
    MsgLookup, NodeApi, Result,
};
use crate::types::{
    Address, BlockHeader, MessageReceipt, SignedMessage, Tipset, TipsetKeys, TokenAmount,
    UnsignedMessage,
};

const HEAD_CHANGE_BUFFER: usize = 32;

pub struct RpcNode {
    client: WsClient,
}

impl RpcNode {
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Other(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = WsClientBuilder::default()
            .set_headers(headers)
            .build(url)
            .await
            .map_err(|e| Error::Api(e.to_string()))?;
        Ok(RpcNode { client })
    }

    async fn call<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: jsonrpsee::core::params::ArrayParams,
    ) -> Result<R> {
        self.client
            .request(method, params)
            .await
            .map_err(|e| Error::Api(e.to_string()))
    }
}

#[async_trait]
impl NodeApi for RpcNode {
    async fn chain_notify(&self) -> Result<mpsc::Receiver<Vec<HeadChange>>> {
        let mut sub: Subscription<Vec<HeadChange>> = self
            .client
            .subscribe(
                "Filecoin.ChainNotify",
                rpc_params![],
                "Filecoin.ChainNotifyUnsub",
            )
            .await
            .map_err(|e| Error::Api(e.to_string()))?;
        let (tx, rx) = mpsc::channel(HEAD_CHANGE_BUFFER);
        tokio::spawn(async move {
            while let Some(batch) = sub.next().await {
                match batch {
                    Ok(batch) => {
                        if tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("chain notify decode failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn chain_head(&self) -> Result<Tipset> {
        self.call("Filecoin.ChainHead", rpc_params![]).await
    }

    async fn chain_get_tipset(&self, key: &TipsetKeys) -> Result<Tipset> {
        self.call("Filecoin.ChainGetTipSet", rpc_params![key]).await
    }

    async fn chain_get_block(&self, cid: &Cid) -> Result<BlockHeader> {
        self.call("Filecoin.ChainGetBlock", rpc_params![cid]).await
    }

    async fn chain_get_block_messages(&self, blk: &Cid) -> Result<BlockMessages> {
        self.call("Filecoin.ChainGetBlockMessages", rpc_params![blk])
            .await
    }

    async fn chain_get_parent_messages(
        &self,
        blk: &Cid,
    ) -> Result<Vec<(Cid, UnsignedMessage)>> {
        self.call("Filecoin.ChainGetParentMessages", rpc_params![blk])
            .await
    }

    async fn chain_get_parent_receipts(&self, blk: &Cid) -> Result<Vec<MessageReceipt>> {
        self.call("Filecoin.ChainGetParentReceipts", rpc_params![blk])
            .await
    }

    async fn state_account_key(&self, addr: &Address, key: &TipsetKeys) -> Result<Address> {
        self.call("Filecoin.StateAccountKey", rpc_params![addr, key])
            .await
    }

    async fn state_search_msg(&self, cid: &Cid) -> Result<Option<MsgLookup>> {
        self.call("Filecoin.StateSearchMsg", rpc_params![cid]).await
    }

    async fn state_get_actor(&self, addr: &Address, key: &TipsetKeys) -> Result<Actor> {
        self.call("Filecoin.StateGetActor", rpc_params![addr, key])
            .await
    }

    async fn gas_estimate_message_gas(
        &self,
        msg: &UnsignedMessage,
        spec: &MessageSendSpec,
        key: &TipsetKeys,
    ) -> Result<UnsignedMessage> {
        self.call(
            "Filecoin.GasEstimateMessageGas",
            rpc_params![msg, spec, key],
        )
        .await
    }

    async fn gas_estimate_fee_cap(
        &self,
        msg: &UnsignedMessage,
        max_queue_blocks: i64,
        key: &TipsetKeys,
    ) -> Result<TokenAmount> {
        self.call(
            "Filecoin.GasEstimateFeeCap",
            rpc_params![msg, max_queue_blocks, key],
        )
        .await
    }

    async fn gas_estimate_gas_premium(
        &self,
        nblocksincl: u64,
        sender: &Address,
        gas_limit: i64,
        key: &TipsetKeys,
    ) -> Result<TokenAmount> {
        self.call(
            "Filecoin.GasEstimateGasPremium",
            rpc_params![nblocksincl, sender, gas_limit, key],
        )
        .await
    }

    async fn gas_estimate_gas_limit(
        &self,
        msg: &UnsignedMessage,
        key: &TipsetKeys,
    ) -> Result<i64> {
        self.call("Filecoin.GasEstimateGasLimit", rpc_params![msg, key])
            .await
    }

    async fn gas_batch_estimate_message_gas(
        &self,
        msgs: &[EstimateMessage],
        from_nonce: u64,
        key: &TipsetKeys,
    ) -> Result<Vec<EstimateResult>> {
        self.call(
            "Filecoin.GasBatchEstimateMessageGas",
            rpc_params![msgs, from_nonce, key],
        )
        .await
    }

    async fn mpool_push(&self, msg: &SignedMessage) -> Result<Cid> {
        self.call("Filecoin.MpoolPush", rpc_params![msg]).await
    }

    async fn mpool_batch_push(&self, msgs: &[SignedMessage]) -> Result<Vec<Cid>> {
        self.call("Filecoin.MpoolBatchPush", rpc_params![msgs]).await
    }

    async fn mpool_publish_by_addr(&self, addr: &Address) -> Result<()> {
        self.call("Filecoin.MpoolPublishByAddr", rpc_params![addr])
            .await
    }

    async fn mpool_publish_message(&self, msg: &SignedMessage) -> Result<()> {
        self.call("Filecoin.MpoolPublishMessage", rpc_params![msg])
            .await
    }
}
