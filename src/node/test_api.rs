// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Scripted node used by the unit tests: state, estimates and head changes
//! are all set by the test, pushes are recorded for inspection.

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{
    Actor, BlockMessages, Error, EstimateMessage, EstimateResult, HeadChange, MessageSendSpec,
    MsgLookup, NodeApi, Result,
};
use crate::types::message::cid_from_cbor;
use crate::types::{
    Address, BlockHeader, ChainEpoch, MessageReceipt, SignedMessage, Tipset, TipsetKeys,
    TokenAmount, UnsignedMessage,
};
use async_trait::async_trait;

pub const TEST_GAS_LIMIT: i64 = 600_000;
pub const TEST_GAS_PREMIUM: i64 = 100;
pub const TEST_GAS_FEE_CAP: i64 = 1_000;

pub fn mock_cid(seed: u64) -> Cid {
    cid_from_cbor(&seed).unwrap()
}

pub fn mock_block(seed: u64, epoch: ChainEpoch, parents: TipsetKeys) -> BlockHeader {
    BlockHeader {
        cid: mock_cid(seed),
        epoch,
        parents,
    }
}

/// A single-block tipset with no parents.
pub fn mock_tipset(seed: u64, epoch: ChainEpoch) -> Tipset {
    Tipset::new(vec![mock_block(seed, epoch, TipsetKeys::default())]).unwrap()
}

pub fn mock_tipset_with_parents(parent: &Tipset, seed: u64, epoch: ChainEpoch) -> Tipset {
    Tipset::new(vec![mock_block(seed, epoch, parent.key().clone())]).unwrap()
}

#[derive(Default)]
struct Inner {
    head: Option<Tipset>,
    actors: HashMap<Address, Actor>,
    tipsets: HashMap<TipsetKeys, Tipset>,
    block_messages: HashMap<Cid, BlockMessages>,
    parent_messages: HashMap<Cid, Vec<(Cid, UnsignedMessage)>>,
    parent_receipts: HashMap<Cid, Vec<MessageReceipt>>,
    search: HashMap<Cid, MsgLookup>,
    estimate_errors: HashMap<Cid, String>,
    pushed: Vec<SignedMessage>,
    published: Vec<SignedMessage>,
    fail_push: bool,
}

pub struct TestNode {
    inner: Arc<Mutex<Inner>>,
    publisher: broadcast::Sender<Vec<HeadChange>>,
}

impl Default for TestNode {
    fn default() -> Self {
        let (publisher, _) = broadcast::channel(64);
        TestNode {
            inner: Arc::new(Mutex::new(Inner::default())),
            publisher,
        }
    }
}

impl TestNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, ts: Tipset) {
        let mut inner = self.inner.lock();
        inner.tipsets.insert(ts.key().clone(), ts.clone());
        inner.head = Some(ts);
    }

    pub fn add_tipset(&self, ts: Tipset) {
        self.inner.lock().tipsets.insert(ts.key().clone(), ts);
    }

    pub fn set_actor(&self, addr: &Address, actor: Actor) {
        self.inner.lock().actors.insert(addr.clone(), actor);
    }

    pub fn set_state_nonce(&self, addr: &Address, nonce: u64) {
        let mut inner = self.inner.lock();
        inner
            .actors
            .entry(addr.clone())
            .or_insert_with(|| Actor {
                nonce: 0,
                balance: TokenAmount::from_atto(1_000_000_000_000_000_000_i64),
            })
            .nonce = nonce;
    }

    pub fn set_block_messages(&self, blk: &Cid, msgs: BlockMessages) {
        self.inner.lock().block_messages.insert(*blk, msgs);
    }

    pub fn set_parent_data(
        &self,
        blk: &Cid,
        msgs: Vec<(Cid, UnsignedMessage)>,
        receipts: Vec<MessageReceipt>,
    ) {
        let mut inner = self.inner.lock();
        inner.parent_messages.insert(*blk, msgs);
        inner.parent_receipts.insert(*blk, receipts);
    }

    pub fn set_search_result(&self, cid: &Cid, lookup: MsgLookup) {
        self.inner.lock().search.insert(*cid, lookup);
    }

    pub fn set_estimate_error(&self, unsigned_cid: &Cid, err: &str) {
        self.inner
            .lock()
            .estimate_errors
            .insert(*unsigned_cid, err.to_string());
    }

    pub fn clear_estimate_error(&self, unsigned_cid: &Cid) {
        self.inner.lock().estimate_errors.remove(unsigned_cid);
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.inner.lock().fail_push = fail;
    }

    pub fn pushed_messages(&self) -> Vec<SignedMessage> {
        self.inner.lock().pushed.clone()
    }

    pub fn published_messages(&self) -> Vec<SignedMessage> {
        self.inner.lock().published.clone()
    }

    /// Deliver a head-change batch to every open subscription. `Apply`
    /// tipsets also advance the scripted head.
    pub fn publish_head(&self, changes: Vec<HeadChange>) {
        {
            let mut inner = self.inner.lock();
            for change in &changes {
                if let HeadChange::Apply(ts) | HeadChange::Current(ts) = change {
                    inner.tipsets.insert(ts.key().clone(), ts.clone());
                    inner.head = Some(ts.clone());
                }
            }
        }
        // no subscribers is fine
        let _ = self.publisher.send(changes);
    }

    fn estimate_one(&self, em: &EstimateMessage) -> EstimateResult {
        let inner = self.inner.lock();
        let unsigned_cid = em.msg.cid().expect("cid of test message");
        if let Some(err) = inner.estimate_errors.get(&unsigned_cid) {
            return EstimateResult {
                msg: em.msg.clone(),
                err: err.clone(),
            };
        }
        let mut msg = em.msg.clone();
        let over = if em.spec.gas_over_estimation > 0.0 {
            em.spec.gas_over_estimation
        } else {
            1.0
        };
        if msg.gas_limit == 0 {
            msg.gas_limit = (TEST_GAS_LIMIT as f64 * over) as i64;
        }
        if msg.gas_premium.is_zero() {
            msg.gas_premium = TokenAmount::from_atto(TEST_GAS_PREMIUM);
        }
        if msg.gas_fee_cap.is_zero() {
            msg.gas_fee_cap = TokenAmount::from_atto(TEST_GAS_FEE_CAP);
        }
        EstimateResult {
            msg,
            err: String::new(),
        }
    }
}

#[async_trait]
impl NodeApi for TestNode {
    async fn chain_notify(&self) -> Result<mpsc::Receiver<Vec<HeadChange>>> {
        let mut sub = self.publisher.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let head = self.inner.lock().head.clone();
        tokio::spawn(async move {
            if let Some(head) = head {
                if tx.send(vec![HeadChange::Current(head)]).await.is_err() {
                    return;
                }
            }
            while let Ok(batch) = sub.recv().await {
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn chain_head(&self) -> Result<Tipset> {
        self.inner
            .lock()
            .head
            .clone()
            .ok_or_else(|| Error::Other("no head set".to_string()))
    }

    async fn chain_get_tipset(&self, key: &TipsetKeys) -> Result<Tipset> {
        self.inner
            .lock()
            .tipsets
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no tipset for key {key:?}")))
    }

    async fn chain_get_block(&self, cid: &Cid) -> Result<BlockHeader> {
        self.inner
            .lock()
            .tipsets
            .values()
            .flat_map(|ts| ts.blocks())
            .find(|b| &b.cid == cid)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no block {cid}")))
    }

    async fn chain_get_block_messages(&self, blk: &Cid) -> Result<BlockMessages> {
        Ok(self
            .inner
            .lock()
            .block_messages
            .get(blk)
            .cloned()
            .unwrap_or_default())
    }

    async fn chain_get_parent_messages(
        &self,
        blk: &Cid,
    ) -> Result<Vec<(Cid, UnsignedMessage)>> {
        Ok(self
            .inner
            .lock()
            .parent_messages
            .get(blk)
            .cloned()
            .unwrap_or_default())
    }

    async fn chain_get_parent_receipts(&self, blk: &Cid) -> Result<Vec<MessageReceipt>> {
        Ok(self
            .inner
            .lock()
            .parent_receipts
            .get(blk)
            .cloned()
            .unwrap_or_default())
    }

    async fn state_account_key(&self, addr: &Address, _key: &TipsetKeys) -> Result<Address> {
        Ok(addr.clone())
    }

    async fn state_search_msg(&self, cid: &Cid) -> Result<Option<MsgLookup>> {
        Ok(self.inner.lock().search.get(cid).cloned())
    }

    async fn state_get_actor(&self, addr: &Address, _key: &TipsetKeys) -> Result<Actor> {
        self.inner
            .lock()
            .actors
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::ActorNotFound(addr.clone()))
    }

    async fn gas_estimate_message_gas(
        &self,
        msg: &UnsignedMessage,
        spec: &MessageSendSpec,
        _key: &TipsetKeys,
    ) -> Result<UnsignedMessage> {
        let res = self.estimate_one(&EstimateMessage {
            msg: msg.clone(),
            spec: spec.clone(),
        });
        if res.err.is_empty() {
            Ok(res.msg)
        } else {
            Err(Error::Api(res.err))
        }
    }

    async fn gas_estimate_fee_cap(
        &self,
        _msg: &UnsignedMessage,
        _max_queue_blocks: i64,
        _key: &TipsetKeys,
    ) -> Result<TokenAmount> {
        Ok(TokenAmount::from_atto(TEST_GAS_FEE_CAP))
    }

    async fn gas_estimate_gas_premium(
        &self,
        _nblocksincl: u64,
        _sender: &Address,
        _gas_limit: i64,
        _key: &TipsetKeys,
    ) -> Result<TokenAmount> {
        Ok(TokenAmount::from_atto(TEST_GAS_PREMIUM))
    }

    async fn gas_estimate_gas_limit(
        &self,
        _msg: &UnsignedMessage,
        _key: &TipsetKeys,
    ) -> Result<i64> {
        Ok(TEST_GAS_LIMIT)
    }

    async fn gas_batch_estimate_message_gas(
        &self,
        msgs: &[EstimateMessage],
        _from_nonce: u64,
        _key: &TipsetKeys,
    ) -> Result<Vec<EstimateResult>> {
        Ok(msgs.iter().map(|em| self.estimate_one(em)).collect())
    }

    async fn mpool_push(&self, msg: &SignedMessage) -> Result<Cid> {
        let mut inner = self.inner.lock();
        if inner.fail_push {
            return Err(Error::Api("mpool push refused".to_string()));
        }
        inner.pushed.push(msg.clone());
        msg.cid().map_err(|e| Error::Other(e.to_string()))
    }

    async fn mpool_batch_push(&self, msgs: &[SignedMessage]) -> Result<Vec<Cid>> {
        let mut inner = self.inner.lock();
        if inner.fail_push {
            return Err(Error::Api("mpool push refused".to_string()));
        }
        let mut cids = Vec::with_capacity(msgs.len());
        for msg in msgs {
            inner.pushed.push(msg.clone());
            cids.push(msg.cid().map_err(|e| Error::Other(e.to_string()))?);
        }
        Ok(cids)
    }

    async fn mpool_publish_by_addr(&self, _addr: &Address) -> Result<()> {
        Ok(())
    }

    async fn mpool_publish_message(&self, msg: &SignedMessage) -> Result<()> {
        self.inner.lock().published.push(msg.clone());
        Ok(())
    }
}
