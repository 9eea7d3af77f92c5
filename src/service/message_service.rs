// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message-lifecycle engine: consumes head changes, runs the selector on
//! a tick, broadcasts signed messages, and keeps the hot cache, the tipset
//! journal and the repository in step.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cid::Cid;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::selector::{cap_gas_fee, MessageSelector, SelectResult};
use super::tipset_cache::{TipsetCache, TipsetRecord};
use super::{Error, MessageStateCache, Result, SharedParamsService, WalletService};
use crate::node::{HeadChange, MessageSendSpec, NodeApi};
use crate::repo::Repo;
use crate::types::{
    Address, ChainEpoch, Message, MessageReceipt, MessageState, MsgMeta, SignedMessage, Tipset,
    TipsetKeys, TokenAmount, UnsignedMessage,
};
use crate::wallet::{SignMeta, SignType};

/// Ancestor-walk depth before a reorg is declared too deep to repair.
const LOOK_BACK_LIMIT: usize = 1000;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WALLET_SIGN_TIMEOUT: Duration = Duration::from_secs(1);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct MessageServiceConfig {
    /// On-disk journal of recently applied tipsets.
    pub tipset_file_path: PathBuf,
    /// How often filled-but-unconfirmed messages are re-broadcast.
    pub republish_interval: Duration,
}

impl Default for MessageServiceConfig {
    fn default() -> Self {
        MessageServiceConfig {
            tipset_file_path: PathBuf::from("messager_tipset.json"),
            republish_interval: Duration::from_secs(30),
        }
    }
}

pub struct MessageService {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeApi>,
    cfg: MessageServiceConfig,
    sps: Arc<SharedParamsService>,
    wallet_service: Arc<WalletService>,
    selector: MessageSelector,

    message_state: MessageStateCache,
    tipset_cache: TipsetCache,
    current_head: RwLock<Option<Tipset>>,
    /// Wakes the push loop ahead of its tick, e.g. after a head change.
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Last broadcast instant per signed cid, for republish staleness.
    last_published: Mutex<HashMap<Cid, Instant>>,
}

impl MessageService {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeApi>,
        cfg: MessageServiceConfig,
        sps: Arc<SharedParamsService>,
        wallet_service: Arc<WalletService>,
    ) -> Result<Self> {
        let tipset_cache = TipsetCache::new(&cfg.tipset_file_path);
        tipset_cache.load()?;

        let message_state = MessageStateCache::new();
        let active: Vec<Message> = repo
            .message_repo()
            .list_message()?
            .into_iter()
            .filter(|m| !m.state.is_terminal())
            .collect();
        message_state.load(active);

        let selector = MessageSelector::new(
            repo.clone(),
            node.clone(),
            sps.clone(),
            wallet_service.clone(),
        );
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        Ok(MessageService {
            repo,
            node,
            cfg,
            sps,
            wallet_service,
            selector,
            message_state,
            tipset_cache,
            current_head: RwLock::new(None),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            last_published: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the three long-running loops. The returned handles finish when
    /// `shutdown` flips.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().spawn_head_change_loop(shutdown.clone()),
            self.clone().spawn_push_loop(shutdown.clone()),
            self.clone().spawn_republish_loop(shutdown),
        ]
    }

    // ---- public operations -------------------------------------------------

    pub fn push_message(
        &self,
        msg: UnsignedMessage,
        meta: MsgMeta,
        wallet_name: String,
    ) -> Result<Uuid> {
        self.push_message_with_id(Uuid::new_v4(), msg, meta, wallet_name)
    }

    pub fn push_message_with_id(
        &self,
        id: Uuid,
        msg: UnsignedMessage,
        mut meta: MsgMeta,
        wallet_name: String,
    ) -> Result<Uuid> {
        if self.repo.message_repo().has_message_by_id(&id)? {
            return Err(Error::DuplicateId(id));
        }
        let info = match self.repo.address_repo().get_address(&msg.from) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Err(Error::AddressNotExists(msg.from.clone())),
            Err(e) => return Err(e.into()),
        };
        if info.state == crate::types::AddressState::Forbidden {
            return Err(Error::AddressForbidden(msg.from.clone()));
        }
        if meta.expire_epoch == 0 {
            meta.expire_epoch = self.sps.get_params().expire_epoch;
        }
        let message = Message::with_id(id, msg, meta, wallet_name);
        self.repo.message_repo().save_message(&message)?;
        self.message_state.insert(message);
        self.trigger_push();
        Ok(id)
    }

    pub fn has_message_by_uid(&self, id: &Uuid) -> Result<bool> {
        if self.message_state.contains(id) {
            return Ok(true);
        }
        Ok(self.repo.message_repo().has_message_by_id(id)?)
    }

    pub fn get_message_by_uid(&self, id: &Uuid) -> Result<Message> {
        if let Some(msg) = self.message_state.get(id) {
            return Ok(msg);
        }
        match self.repo.message_repo().get_message_by_id(id) {
            Ok(msg) => Ok(msg),
            Err(e) if e.is_not_found() => Err(Error::UnknownMessage(*id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_message_state(&self, id: &Uuid) -> Result<MessageState> {
        Ok(self.get_message_by_uid(id)?.state)
    }

    /// Lookup by either cid; signed takes precedence.
    pub fn get_message_by_cid(&self, cid: &Cid) -> Result<Message> {
        if let Some(msg) = self.message_state.get_by_signed_cid(cid) {
            return Ok(msg);
        }
        if let Some(msg) = self.message_state.get_by_unsigned_cid(cid) {
            return Ok(msg);
        }
        self.repo
            .message_repo()
            .get_message_by_signed_cid(cid)
            .or_else(|_| self.repo.message_repo().get_message_by_unsigned_cid(cid))
            .map_err(Into::into)
    }

    pub fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message> {
        if let Some(msg) = self.message_state.get_by_signed_cid(cid) {
            return Ok(msg);
        }
        Ok(self.repo.message_repo().get_message_by_signed_cid(cid)?)
    }

    pub fn get_message_by_unsigned_cid(&self, cid: &Cid) -> Result<Message> {
        if let Some(msg) = self.message_state.get_by_unsigned_cid(cid) {
            return Ok(msg);
        }
        Ok(self.repo.message_repo().get_message_by_unsigned_cid(cid)?)
    }

    pub fn get_message_by_from_and_nonce(&self, from: &Address, nonce: u64) -> Result<Message> {
        Ok(self
            .repo
            .message_repo()
            .get_message_by_from_and_nonce(from, nonce)?)
    }

    pub fn list_message(&self) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_message()?)
    }

    pub fn list_message_by_address(&self, addr: &Address) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_message_by_address(addr)?)
    }

    pub fn list_message_by_from_state(
        &self,
        from: &Address,
        state: MessageState,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        Ok(self
            .repo
            .message_repo()
            .list_message_by_from_state(from, state, page_index, page_size)?)
    }

    pub fn list_failed_message(&self) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_failed_message()?)
    }

    pub fn list_blocked_message(
        &self,
        addr: &Address,
        older_than: Duration,
    ) -> Result<Vec<Message>> {
        Ok(self
            .repo
            .message_repo()
            .list_blocked_message(addr, older_than)?)
    }

    pub fn update_message_state_by_id(&self, id: &Uuid, state: MessageState) -> Result<()> {
        self.repo
            .message_repo()
            .update_message_state_by_id(id, state)?;
        self.message_state.update(id, |m| m.state = state);
        Ok(())
    }

    pub fn update_message_state_by_cid(&self, cid: &Cid, state: MessageState) -> Result<()> {
        self.repo
            .message_repo()
            .update_message_state_by_cid(cid, state)?;
        if let Some(msg) = self.message_state.get_by_signed_cid(cid) {
            self.message_state.update(&msg.id, |m| m.state = state);
        }
        Ok(())
    }

    /// Operator escape hatch: force a message terminally failed.
    pub fn mark_bad_message(&self, id: &Uuid) -> Result<()> {
        self.repo.message_repo().mark_bad_message(id)?;
        self.message_state
            .update(id, |m| m.state = MessageState::Failed);
        info!(id = %id, "message marked bad");
        Ok(())
    }

    /// Block until the message is on chain with the requested confirmation
    /// depth. Terminal states fail fast.
    pub async fn wait_message(&self, id: &Uuid, confidence: u64) -> Result<Message> {
        let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let msg = self.get_message_by_uid(id)?;
            match msg.state {
                MessageState::OnChain => {
                    let cached = self.current_head.read().clone();
                    let head_height = match cached {
                        Some(ts) => ts.epoch(),
                        None => self.node.chain_head().await?.epoch(),
                    };
                    if head_height - msg.height >= confidence as ChainEpoch {
                        return Ok(msg);
                    }
                }
                state if state.is_terminal() => {
                    return Err(Error::InvalidMessageState(*id, state));
                }
                _ => {}
            }
        }
    }

    /// Re-broadcast a filled message as-is. No state change.
    pub async fn republish_message(&self, id: &Uuid) -> Result<()> {
        let msg = self.get_message_by_uid(id)?;
        if msg.state != MessageState::Filled {
            return Err(Error::InvalidMessageState(*id, msg.state));
        }
        let smsg = msg
            .signed_message()
            .ok_or_else(|| Error::Other(format!("filled message {id} missing signature")))?;
        self.node.mpool_publish_message(&smsg).await?;
        self.mark_published([smsg.cid()?]);
        Ok(())
    }

    /// Produce a replacement at the same nonce with raised gas, mark the
    /// original replaced, and push the replacement.
    pub async fn replace_message(
        &self,
        id: &Uuid,
        auto: bool,
        max_fee: TokenAmount,
        gas_limit: i64,
        gas_premium: TokenAmount,
        gas_fee_cap: TokenAmount,
    ) -> Result<Cid> {
        let msg = self.get_message_by_uid(id)?;
        if msg.state != MessageState::Filled {
            return Err(Error::InvalidMessageState(*id, msg.state));
        }

        let mut unsigned = msg.message.clone();
        if auto {
            let params = self.sps.get_params();
            let bumped = bump_premium(&unsigned.gas_premium);
            let effective_max_fee = if !max_fee.is_zero() {
                max_fee
            } else if !msg.meta.max_fee.is_zero() {
                msg.meta.max_fee.clone()
            } else {
                params.max_fee.clone()
            };
            let over = if msg.meta.gas_over_estimation != 0.0 {
                msg.meta.gas_over_estimation
            } else {
                params.gas_over_estimation
            };
            unsigned.gas_limit = 0;
            unsigned.gas_fee_cap = TokenAmount::default();
            unsigned.gas_premium = bumped.clone();
            let spec = MessageSendSpec {
                max_fee: effective_max_fee.clone(),
                gas_over_estimation: over,
            };
            unsigned = self
                .node
                .gas_estimate_message_gas(&unsigned, &spec, &TipsetKeys::default())
                .await?;
            if unsigned.gas_premium < bumped {
                unsigned.gas_premium = bumped;
            }
            if unsigned.gas_fee_cap < unsigned.gas_premium {
                unsigned.gas_fee_cap = unsigned.gas_premium.clone();
            }
            cap_gas_fee(&mut unsigned, &effective_max_fee);
        } else {
            if gas_limit > 0 {
                unsigned.gas_limit = gas_limit;
            }
            if !gas_premium.is_zero() {
                unsigned.gas_premium = gas_premium;
            }
            if !gas_fee_cap.is_zero() {
                unsigned.gas_fee_cap = gas_fee_cap;
            }
        }

        let client = self.wallet_service.get_client(&msg.wallet_name)?;
        let unsigned_cid = unsigned.cid()?;
        let data = unsigned.marshal_cbor()?;
        let sig = timeout(
            WALLET_SIGN_TIMEOUT,
            client.wallet_sign(
                &msg.wallet_name,
                &unsigned.from,
                &unsigned_cid.to_bytes(),
                &SignMeta {
                    sign_type: SignType::ChainMsg,
                    extra: data,
                },
            ),
        )
        .await
        .map_err(|_| crate::wallet::Error::Timeout("wallet_sign"))??;

        let mut replacement =
            Message::new(unsigned, msg.meta.clone(), msg.wallet_name.clone());
        replacement.unsigned_cid = Some(unsigned_cid);
        replacement.signature = Some(sig);
        replacement.state = MessageState::Filled;
        replacement.signed_cid = replacement.compute_signed_cid();
        let signed_cid = replacement
            .signed_cid
            .ok_or_else(|| Error::Other("replacement cid".to_string()))?;

        self.repo.transaction(&mut |tx| {
            tx.message_repo().save_message(&replacement)?;
            tx.message_repo()
                .update_message_state_by_id(id, MessageState::Replaced)
        })?;
        self.message_state.insert(replacement.clone());
        self.message_state
            .update(id, |m| m.state = MessageState::Replaced);
        info!(
            original = %id,
            replacement = %replacement.id,
            nonce = replacement.message.sequence,
            "message replaced"
        );

        if let Some(smsg) = replacement.signed_message() {
            if let Err(e) = self.node.mpool_push(&smsg).await {
                warn!(id = %replacement.id, "replacement push failed, republish will retry: {e}");
            } else {
                self.mark_published([signed_cid]);
            }
        }
        Ok(signed_cid)
    }

    /// Diagnostic sweep over every filled message: re-derive the signed cid
    /// from the stored signature and reconcile on-chain status through
    /// `StateSearchMsg`. Returns how many messages were updated.
    pub async fn update_all_filled_message(&self) -> Result<usize> {
        let mut updated = 0;
        for msg in self.repo.message_repo().list_all_filled_message()? {
            if self.update_filled_message(&msg).await? {
                updated += 1;
            }
        }
        info!(updated, "filled message sweep done");
        Ok(updated)
    }

    /// Single-message variant of the sweep.
    pub async fn update_filled_message_by_id(&self, id: &Uuid) -> Result<Uuid> {
        let msg = self.get_message_by_uid(id)?;
        if msg.state != MessageState::Filled {
            return Err(Error::InvalidMessageState(*id, msg.state));
        }
        self.update_filled_message(&msg).await?;
        Ok(*id)
    }

    async fn update_filled_message(&self, msg: &Message) -> Result<bool> {
        let Some(signed_cid) = msg.compute_signed_cid() else {
            return Ok(false);
        };
        if msg.signed_cid != Some(signed_cid) {
            let mut corrected = msg.clone();
            corrected.signed_cid = Some(signed_cid);
            corrected.unsigned_cid = Some(corrected.message.cid()?);
            self.repo
                .message_repo()
                .update_signed_message_by_id(&corrected)?;
            self.message_state.insert(corrected);
        }
        match self.node.state_search_msg(&signed_cid).await? {
            Some(lookup) => {
                self.repo.message_repo().update_message_receipt(
                    &signed_cid,
                    Some(lookup.receipt.clone()),
                    lookup.height,
                    MessageState::OnChain,
                )?;
                self.message_state.update(&msg.id, |m| {
                    m.receipt = Some(lookup.receipt.clone());
                    m.height = lookup.height;
                    m.state = MessageState::OnChain;
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- head-change processing --------------------------------------------

    fn spawn_head_change_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            'outer: loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut stream = match self.node.chain_notify().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("chain notify subscribe failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                };
                info!("subscribed to chain notify");
                loop {
                    tokio::select! {
                        batch = stream.recv() => {
                            let Some(batch) = batch else {
                                warn!("chain notify stream closed, resubscribing");
                                break;
                            };
                            if let Err(e) = self.process_head_change(batch).await {
                                if is_fatal(&e) {
                                    error!("fatal head-change failure, halting ingestion: {e}");
                                    break 'outer;
                                }
                                warn!("head change processing failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            }
            if let Err(e) = self.tipset_cache.flush() {
                error!("tipset cache flush on shutdown failed: {e}");
            }
        })
    }

    /// Apply one chain-notify delivery in order: a `Current` head triggers
    /// reconnect reconciliation, reverts and applies are batched.
    pub async fn process_head_change(&self, batch: Vec<HeadChange>) -> Result<()> {
        let mut revert_heights = Vec::new();
        let mut apply = Vec::new();
        for change in batch {
            match change {
                HeadChange::Current(ts) => self.reconnect_check(&ts).await?,
                HeadChange::Revert(ts) => revert_heights.push(ts.epoch()),
                HeadChange::Apply(ts) => apply.push(ts),
            }
        }
        if !revert_heights.is_empty() || !apply.is_empty() {
            self.do_refresh_message_state(revert_heights, apply).await?;
        }
        Ok(())
    }

    /// Reconcile the persisted tipset journal with a freshly delivered head:
    /// walk the head's ancestry until it meets a cached tipset, revert-scan
    /// anything the journal holds above the fork, and apply the gap.
    pub async fn reconnect_check(&self, head: &Tipset) -> Result<()> {
        info!(height = head.epoch(), "reconnect check");
        let records = self.tipset_cache.records_desc();
        if records.is_empty() {
            self.tipset_cache.add(TipsetRecord::from_tipset(head));
            self.tipset_cache.flush()?;
            *self.current_head.write() = Some(head.clone());
            return Ok(());
        }
        if records[0].height == head.epoch() && records[0].matches(head) {
            debug!("head unchanged since last run");
            *self.current_head.write() = Some(head.clone());
            return Ok(());
        }

        let (gap, fork_idx) = self.look_ancestors(&records, head).await?;
        let stale: Vec<ChainEpoch> = records[..fork_idx].iter().map(|r| r.height).collect();
        let mut apply = gap;
        apply.reverse();
        self.do_refresh_message_state(stale, apply).await?;
        self.tipset_cache.flush()?;
        *self.current_head.write() = Some(head.clone());
        Ok(())
    }

    /// Walk from `head` towards genesis until a cached tipset matches.
    /// Returns the gap tipsets (newest first) and the index of the fork
    /// point in `records`; everything before that index is stale local
    /// state.
    async fn look_ancestors(
        &self,
        records: &[TipsetRecord],
        head: &Tipset,
    ) -> Result<(Vec<Tipset>, usize)> {
        let mut ts = head.clone();
        let mut idx = 0usize;
        let mut gap = Vec::new();
        let mut loops = 0usize;
        while idx < records.len() && ts.epoch() > 0 {
            if loops > LOOK_BACK_LIMIT {
                return Err(Error::TooDeepReorg(LOOK_BACK_LIMIT));
            }
            let local = &records[idx];
            if local.height > ts.epoch() {
                // journal has tipsets the chain no longer does
                idx += 1;
            } else if local.height == ts.epoch() {
                if local.matches(&ts) {
                    break;
                }
                idx += 1;
            } else {
                gap.push(ts.clone());
                ts = self.node.chain_get_tipset(ts.parents()).await?;
            }
            loops += 1;
        }
        Ok((gap, idx))
    }

    /// The heart of the head-change loop. Reverts walk newest to oldest and
    /// put messages back to `Filled` with receipt and height cleared; applies
    /// walk oldest to newest matching parent messages to cached signed cids.
    /// Everything lands in one repository transaction, then the hot cache
    /// and tipset journal are brought in line.
    pub async fn do_refresh_message_state(
        &self,
        mut revert_heights: Vec<ChainEpoch>,
        mut apply: Vec<Tipset>,
    ) -> Result<()> {
        revert_heights.sort_by_key(|h| Reverse(*h));
        apply.sort_by_key(Tipset::epoch);

        let mut downgrades: Vec<Message> = Vec::new();
        for height in &revert_heights {
            downgrades.extend(
                self.repo
                    .message_repo()
                    .get_signed_messages_by_height(*height)?,
            );
            self.tipset_cache.remove(*height);
        }

        struct Landed {
            cid: Cid,
            id: Uuid,
            receipt: MessageReceipt,
            height: ChainEpoch,
        }
        let mut landed: Vec<Landed> = Vec::new();
        for ts in &apply {
            for blk in ts.blocks() {
                let msgs = self.node.chain_get_parent_messages(&blk.cid).await?;
                let receipts = self.node.chain_get_parent_receipts(&blk.cid).await?;
                if msgs.len() != receipts.len() {
                    return Err(Error::Other(format!(
                        "block {}: {} parent messages but {} receipts",
                        blk.cid,
                        msgs.len(),
                        receipts.len()
                    )));
                }
                for ((cid, _msg), receipt) in msgs.into_iter().zip(receipts) {
                    if let Some(cached) = self.message_state.get_by_signed_cid(&cid) {
                        landed.push(Landed {
                            cid,
                            id: cached.id,
                            receipt,
                            height: ts.epoch(),
                        });
                    }
                }
            }
        }

        if !downgrades.is_empty() || !landed.is_empty() {
            self.repo.transaction(&mut |tx| {
                let messages = tx.message_repo();
                for msg in &downgrades {
                    let Some(cid) = msg.signed_cid else { continue };
                    messages.update_message_receipt(&cid, None, 0, MessageState::Filled)?;
                }
                for l in &landed {
                    messages.update_message_receipt(
                        &l.cid,
                        Some(l.receipt.clone()),
                        l.height,
                        MessageState::OnChain,
                    )?;
                }
                Ok(())
            })?;
        }

        for msg in &downgrades {
            debug!(id = %msg.id, nonce = msg.message.sequence, "message reverted off chain");
            self.message_state.update(&msg.id, |m| {
                m.receipt = None;
                m.height = 0;
                m.state = MessageState::Filled;
            });
        }
        for l in &landed {
            self.message_state.update(&l.id, |m| {
                m.receipt = Some(l.receipt.clone());
                m.height = l.height;
                m.state = MessageState::OnChain;
            });
        }
        if !landed.is_empty() {
            info!(count = landed.len(), "messages landed on chain");
        }

        if let Some(newest) = apply.last().cloned() {
            self.message_state.evict_confirmed(newest.epoch());
            for ts in &apply {
                self.tipset_cache.add(TipsetRecord::from_tipset(ts));
            }
            self.tipset_cache.reduce(newest.epoch());
            self.tipset_cache.flush()?;
            *self.current_head.write() = Some(newest);
            self.trigger_push();
        } else if !revert_heights.is_empty() {
            self.tipset_cache.flush()?;
        }
        Ok(())
    }

    // ---- push / republish loops --------------------------------------------

    fn trigger_push(&self) {
        // a full slot already means a tick is due
        let _ = self.trigger_tx.try_send(());
    }

    fn spawn_push_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut trigger = self
            .trigger_rx
            .lock()
            .take()
            .expect("push loop already started");
        tokio::spawn(async move {
            loop {
                let scan_interval = self.sps.get_params().scan_interval;
                tokio::select! {
                    _ = tokio::time::sleep(scan_interval) => {}
                    _ = trigger.recv() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = self.do_push_tick().await {
                    warn!("push tick failed: {e}");
                }
            }
        })
    }

    /// One selector run applied transactionally, then broadcast.
    pub async fn do_push_tick(&self) -> Result<()> {
        let cached = self.current_head.read().clone();
        let ts = match cached {
            Some(ts) => ts,
            None => self.node.chain_head().await?,
        };
        let result = self.selector.select_message(&ts).await?;
        self.apply_select_result(&result)?;

        let mut batch = result.to_push_msg;
        batch.extend(result.select_msg.iter().filter_map(Message::signed_message));
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by(|a, b| {
            (&a.message.from, a.message.sequence).cmp(&(&b.message.from, b.message.sequence))
        });
        let cids: Vec<Cid> = batch
            .iter()
            .filter_map(|smsg| smsg.cid().ok())
            .collect();
        match self.node.mpool_batch_push(&batch).await {
            Ok(_) => self.mark_published(cids),
            // not fatal, the republish loop retries
            Err(e) => warn!("mpool batch push failed: {e}"),
        }
        Ok(())
    }

    /// Persist a selection result in a single transaction and mirror it in
    /// the hot cache.
    fn apply_select_result(&self, result: &SelectResult) -> Result<()> {
        if result.select_msg.is_empty()
            && result.expire_msg.is_empty()
            && result.modify_address.is_empty()
            && result.err_msg.is_empty()
        {
            return Ok(());
        }
        self.repo.transaction(&mut |tx| {
            for msg in &result.select_msg {
                tx.message_repo().update_signed_message_by_id(msg)?;
            }
            for addr in &result.modify_address {
                tx.address_repo().update_nonce(&addr.addr, addr.nonce)?;
            }
            tx.message_repo().expire_messages(&result.expire_msg)?;
            for err in &result.err_msg {
                tx.message_repo().update_message_error(&err.id, &err.err)?;
            }
            Ok(())
        })?;

        for msg in &result.select_msg {
            self.message_state.insert(msg.clone());
        }
        for msg in &result.expire_msg {
            self.message_state.remove(&msg.id);
        }
        Ok(())
    }

    fn spawn_republish_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.cfg.republish_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = self.do_republish_tick().await {
                    warn!("republish tick failed: {e}");
                }
            }
        })
    }

    /// Re-broadcast filled messages whose last broadcast is stale. Safe to
    /// run at any time; the mempool deduplicates.
    pub async fn do_republish_tick(&self) -> Result<()> {
        let threshold = self.cfg.republish_interval;
        let now = Instant::now();
        let mut batch: Vec<SignedMessage> = Vec::new();
        for msg in self.repo.message_repo().list_all_filled_message()? {
            let Some(smsg) = msg.signed_message() else {
                continue;
            };
            let cid = smsg.cid()?;
            let stale = self
                .last_published
                .lock()
                .get(&cid)
                .map_or(true, |at| now.duration_since(*at) >= threshold);
            if stale {
                batch.push(smsg);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by(|a, b| {
            (&a.message.from, a.message.sequence).cmp(&(&b.message.from, b.message.sequence))
        });
        debug!(count = batch.len(), "republishing filled messages");
        let cids: Vec<Cid> = batch
            .iter()
            .filter_map(|smsg| smsg.cid().ok())
            .collect();
        self.node.mpool_batch_push(&batch).await?;
        self.mark_published(cids);
        Ok(())
    }

    fn mark_published(&self, cids: impl IntoIterator<Item = Cid>) {
        let now = Instant::now();
        let mut published = self.last_published.lock();
        for cid in cids {
            published.insert(cid, now);
        }
    }

    pub fn current_head(&self) -> Option<Tipset> {
        self.current_head.read().clone()
    }
}

/// Raise a premium for replace-by-fee: a quarter more, and at least one
/// attoFIL more.
fn bump_premium(premium: &TokenAmount) -> TokenAmount {
    let scaled = &(premium * 125u64) / 100u64;
    let floor = premium.clone() + TokenAmount::from_atto(1);
    if scaled >= floor {
        scaled
    } else {
        floor
    }
}

/// Failures the head loop must not survive: a half-applied batch would leave
/// the store inconsistent with the chain.
fn is_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::TooDeepReorg(_) | Error::TipsetFile(_) | Error::Repo(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_api::{
        mock_tipset, mock_tipset_with_parents, TestNode, TEST_GAS_PREMIUM,
    };
    use crate::node::MsgLookup;
    use crate::repo::memory::MemRepo;
    use crate::repo::{AddressRepo, MessageRepo, WalletAddressRepo, WalletRepo};
    use crate::types::{AddressInfo, AddressState, Wallet, WalletAddress};
    use crate::wallet::testing::{TestConnector, TestWallet};
    use chrono::Utc;

    const WALLET: &str = "w1";

    struct Fixture {
        repo: Arc<MemRepo>,
        node: Arc<TestNode>,
        wallet: Arc<TestWallet>,
        sps: Arc<SharedParamsService>,
        svc: Arc<MessageService>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemRepo::new());
        let node = Arc::new(TestNode::new());
        let wallet = Arc::new(TestWallet::new());
        let sps = Arc::new(SharedParamsService::new(repo.clone()).unwrap());
        let wallet_service = Arc::new(WalletService::new(
            repo.clone(),
            Box::new(TestConnector(wallet.clone())),
        ));
        let now = Utc::now();
        WalletRepo::save_wallet(
            repo.as_ref(),
            &Wallet {
                id: Uuid::new_v4(),
                name: WALLET.to_string(),
                url: "http://wallet".to_string(),
                token: String::new(),
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
        let cfg = MessageServiceConfig {
            tipset_file_path: dir.path().join("tipsets.json"),
            republish_interval: Duration::from_secs(30),
        };
        let svc = Arc::new(
            MessageService::new(
                repo.clone(),
                node.clone(),
                cfg,
                sps.clone(),
                wallet_service,
            )
            .unwrap(),
        );
        Fixture {
            repo,
            node,
            wallet,
            sps,
            svc,
            _dir: dir,
        }
    }

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    impl Fixture {
        fn add_address(&self, s: &str, nonce: u64, chain_nonce: u64) -> AddressInfo {
            let mut info = AddressInfo::new(addr(s));
            info.nonce = nonce;
            self.repo.save_address(&info).unwrap();
            self.repo
                .save_wallet_address(&WalletAddress::new(WALLET.to_string(), info.id))
                .unwrap();
            self.node.set_state_nonce(&info.addr, chain_nonce);
            self.wallet.add_key(&info.addr);
            info
        }

        fn push(&self, from: &str, meta: MsgMeta) -> Uuid {
            self.svc
                .push_message(
                    UnsignedMessage {
                        from: addr(from),
                        to: addr("f0999"),
                        value: TokenAmount::from_atto(42),
                        ..Default::default()
                    },
                    meta,
                    WALLET.to_string(),
                )
                .unwrap()
        }

        /// Build a tipset at `epoch` whose single block executes the given
        /// signed messages (as parent messages, with ok receipts).
        fn tipset_executing(&self, seed: u64, epoch: ChainEpoch, msgs: &[Message]) -> Tipset {
            let ts = mock_tipset(seed, epoch);
            let blk = ts.blocks()[0].cid;
            let parent_msgs: Vec<(Cid, UnsignedMessage)> = msgs
                .iter()
                .map(|m| (m.signed_cid.unwrap(), m.message.clone()))
                .collect();
            let receipts = msgs
                .iter()
                .map(|_| MessageReceipt {
                    exit_code: 0,
                    return_data: Default::default(),
                    gas_used: 1_000,
                })
                .collect();
            self.node.set_parent_data(&blk, parent_msgs, receipts);
            self.node.add_tipset(ts.clone());
            ts
        }
    }

    #[tokio::test]
    async fn happy_path_sign_push_land() {
        let f = fixture();
        f.add_address("f0100", 10, 10);
        f.node.set_head(mock_tipset(1, 90));

        let ids: Vec<Uuid> = (0..3).map(|_| f.push("f0100", MsgMeta::default())).collect();
        f.svc.do_push_tick().await.unwrap();

        let filled: Vec<Message> = ids
            .iter()
            .map(|id| f.repo.get_message_by_id(id).unwrap())
            .collect();
        let nonces: Vec<u64> = filled.iter().map(|m| m.message.sequence).collect();
        assert_eq!(nonces, vec![10, 11, 12]);
        assert!(filled.iter().all(|m| m.state == MessageState::Filled));
        assert_eq!(f.node.pushed_messages().len(), 3);
        assert_eq!(f.repo.get_address(&addr("f0100")).unwrap().nonce, 13);

        let ts = f.tipset_executing(2, 100, &filled);
        f.svc
            .do_refresh_message_state(vec![], vec![ts.clone()])
            .await
            .unwrap();
        for id in &ids {
            let msg = f.repo.get_message_by_id(id).unwrap();
            assert_eq!(msg.state, MessageState::OnChain);
            assert_eq!(msg.height, 100);
            assert!(msg.receipt.is_some());
            // hot cache agrees with the repository
            assert_eq!(f.svc.message_state.get(id).unwrap().state, msg.state);
        }
        assert_eq!(f.svc.current_head().unwrap().epoch(), 100);
        // the applied tipset reached the journal
        assert!(f.svc.tipset_cache.get(100).unwrap().matches(&ts));
    }

    #[tokio::test]
    async fn push_message_validation() {
        let f = fixture();
        let err = f
            .svc
            .push_message(
                UnsignedMessage {
                    from: addr("f0100"),
                    to: addr("f0999"),
                    ..Default::default()
                },
                MsgMeta::default(),
                WALLET.to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AddressNotExists(_)));

        let info = f.add_address("f0100", 0, 0);
        f.repo
            .update_state(&info.addr, AddressState::Forbidden)
            .unwrap();
        let err = f
            .svc
            .push_message(
                UnsignedMessage {
                    from: addr("f0100"),
                    to: addr("f0999"),
                    ..Default::default()
                },
                MsgMeta::default(),
                WALLET.to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AddressForbidden(_)));

        f.repo.update_state(&info.addr, AddressState::Alive).unwrap();
        let id = f.push("f0100", MsgMeta::default());
        let err = f
            .svc
            .push_message_with_id(
                id,
                UnsignedMessage {
                    from: addr("f0100"),
                    to: addr("f0999"),
                    ..Default::default()
                },
                MsgMeta::default(),
                WALLET.to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[tokio::test]
    async fn reorg_revert_then_reapply() {
        let f = fixture();
        f.add_address("f0100", 10, 10);
        f.node.set_head(mock_tipset(1, 90));
        let id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();

        let filled = f.repo.get_message_by_id(&id).unwrap();
        let signed_cid = filled.signed_cid.unwrap();
        let before_apply = filled.clone();

        let ts = f.tipset_executing(2, 100, &[filled.clone()]);
        f.svc
            .do_refresh_message_state(vec![], vec![ts])
            .await
            .unwrap();
        assert_eq!(
            f.repo.get_message_by_id(&id).unwrap().state,
            MessageState::OnChain
        );

        // the tipset is reverted: back to filled, signature retained
        f.svc
            .do_refresh_message_state(vec![100], vec![])
            .await
            .unwrap();
        let reverted = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(reverted.state, MessageState::Filled);
        assert_eq!(reverted.height, 0);
        assert!(reverted.receipt.is_none());
        assert_eq!(reverted.signature, before_apply.signature);
        assert_eq!(reverted.signed_cid, Some(signed_cid));
        // apply-then-revert left durable state where it started
        assert_eq!(reverted.message, before_apply.message);
        assert_eq!(f.svc.message_state.get(&id).unwrap().state, reverted.state);

        // republish re-broadcasts the very same envelope
        f.svc.last_published.lock().clear();
        f.svc.do_republish_tick().await.unwrap();
        assert_eq!(f.node.pushed_messages().last().unwrap().cid().unwrap(), signed_cid);

        // a later tipset carries the same signed cid again
        let ts2 = f.tipset_executing(3, 103, &[reverted]);
        f.svc
            .do_refresh_message_state(vec![], vec![ts2])
            .await
            .unwrap();
        let restored = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(restored.state, MessageState::OnChain);
        assert_eq!(restored.height, 103);
    }

    #[tokio::test]
    async fn expiry_lands_terminally() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 50));
        let id = f.push(
            "f0100",
            MsgMeta {
                expire_epoch: 50,
                ..Default::default()
            },
        );

        f.svc.do_push_tick().await.unwrap();
        let msg = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(msg.state, MessageState::Expired);
        assert!(f.svc.message_state.get(&id).is_none());
        assert!(f.node.pushed_messages().is_empty());
    }

    #[tokio::test]
    async fn estimation_strike_out_is_persisted() {
        let f = fixture();
        let mut params = f.sps.get_params();
        params.max_est_fail_num_of_msg = 1;
        f.sps.set_params(params).unwrap();

        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 50));
        let id = f.push("f0100", MsgMeta::default());
        let msg = f.repo.get_message_by_id(&id).unwrap();
        f.node
            .set_estimate_error(&msg.message.cid().unwrap(), "out of gas");

        f.svc.do_push_tick().await.unwrap();
        let after_first = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(after_first.state, MessageState::Unfilled);
        assert!(after_first.error.unwrap().contains("gas estimate:"));

        f.svc.do_push_tick().await.unwrap();
        let after_second = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(after_second.state, MessageState::Failed);
        // the nonce slot was never consumed
        assert_eq!(f.repo.get_address(&addr("f0100")).unwrap().nonce, 0);
    }

    #[tokio::test]
    async fn replace_message_bumps_premium() {
        let f = fixture();
        f.add_address("f0100", 7, 7);
        f.node.set_head(mock_tipset(1, 90));
        let id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();
        let original = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(original.message.sequence, 7);

        let replacement_cid = f
            .svc
            .replace_message(
                &id,
                true,
                TokenAmount::default(),
                0,
                TokenAmount::default(),
                TokenAmount::default(),
            )
            .await
            .unwrap();
        assert_ne!(replacement_cid, original.signed_cid.unwrap());

        assert_eq!(
            f.repo.get_message_by_id(&id).unwrap().state,
            MessageState::Replaced
        );
        let replacement = f
            .repo
            .get_message_by_signed_cid(&replacement_cid)
            .unwrap();
        assert_eq!(replacement.state, MessageState::Filled);
        assert_eq!(replacement.message.sequence, 7);
        assert_eq!(
            replacement.message.gas_premium,
            TokenAmount::from_atto((TEST_GAS_PREMIUM * 125) / 100)
        );
        // the replacement went straight to the mempool
        assert_eq!(
            f.node.pushed_messages().last().unwrap().cid().unwrap(),
            replacement_cid
        );
    }

    #[tokio::test]
    async fn wait_message_confirms_and_fails_fast() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 90));
        let id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();

        let filled = f.repo.get_message_by_id(&id).unwrap();
        let ts = f.tipset_executing(2, 100, &[filled]);
        f.svc
            .do_refresh_message_state(vec![], vec![ts])
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), f.svc.wait_message(&id, 0))
            .await
            .expect("wait timed out")
            .unwrap();
        assert_eq!(msg.state, MessageState::OnChain);
        assert_eq!(msg.height, 100);

        // terminal state fails immediately
        let bad = f.push("f0100", MsgMeta::default());
        f.svc.mark_bad_message(&bad).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), f.svc.wait_message(&bad, 0))
            .await
            .expect("wait timed out")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidMessageState(_, MessageState::Failed)
        ));
    }

    #[tokio::test]
    async fn republish_rebroadcasts_stale_filled() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 90));
        f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();
        assert_eq!(f.node.pushed_messages().len(), 1);

        // just-published messages are not re-broadcast
        f.svc.do_republish_tick().await.unwrap();
        assert_eq!(f.node.pushed_messages().len(), 1);

        // but stale ones are
        f.svc.last_published.lock().clear();
        f.svc.do_republish_tick().await.unwrap();
        assert_eq!(f.node.pushed_messages().len(), 2);
    }

    #[tokio::test]
    async fn update_all_filled_message_reconciles() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 90));
        let id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();

        let msg = f.repo.get_message_by_id(&id).unwrap();
        let signed_cid = msg.signed_cid.unwrap();
        f.node.set_search_result(
            &signed_cid,
            MsgLookup {
                message: signed_cid,
                receipt: MessageReceipt {
                    exit_code: 0,
                    return_data: Default::default(),
                    gas_used: 9,
                },
                tipset: TipsetKeys::default(),
                height: 77,
            },
        );

        let updated = f.svc.update_all_filled_message().await.unwrap();
        assert_eq!(updated, 1);
        let msg = f.repo.get_message_by_id(&id).unwrap();
        assert_eq!(msg.state, MessageState::OnChain);
        assert_eq!(msg.height, 77);
    }

    #[tokio::test]
    async fn reconnect_walks_ancestors_and_repairs() {
        let f = fixture();
        f.add_address("f0100", 0, 0);

        // canonical chain ts1..ts5
        let ts1 = mock_tipset(1, 1);
        let ts2 = mock_tipset_with_parents(&ts1, 2, 2);
        let ts3 = mock_tipset_with_parents(&ts2, 3, 3);
        let ts4 = mock_tipset_with_parents(&ts3, 4, 4);
        let ts5 = mock_tipset_with_parents(&ts4, 5, 5);
        for ts in [&ts1, &ts2, &ts3, &ts4, &ts5] {
            f.node.add_tipset((*ts).clone());
        }

        // the journal saw ts1..ts3 plus a tipset at height 4 the chain
        // dropped while we were away
        for ts in [&ts1, &ts2, &ts3] {
            f.svc.tipset_cache.add(TipsetRecord::from_tipset(ts));
        }
        let foreign = mock_tipset(99, 4);
        f.svc.tipset_cache.add(TipsetRecord::from_tipset(&foreign));

        // a message confirmed in the dropped tipset
        f.node.set_head(mock_tipset(98, 3));
        let lost_id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();
        let lost = f.repo.get_message_by_id(&lost_id).unwrap();
        let lost_ts = f.tipset_executing(99, 4, &[lost]);
        assert_eq!(lost_ts.key(), foreign.key());
        f.svc
            .do_refresh_message_state(vec![], vec![lost_ts])
            .await
            .unwrap();
        assert_eq!(
            f.repo.get_message_by_id(&lost_id).unwrap().state,
            MessageState::OnChain
        );

        // a second pending message that the new branch confirms at ts5
        f.node.set_state_nonce(&addr("f0100"), 1);
        let found_id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();
        let found = f.repo.get_message_by_id(&found_id).unwrap();
        let blk5 = ts5.blocks()[0].cid;
        f.node.set_parent_data(
            &blk5,
            vec![(found.signed_cid.unwrap(), found.message.clone())],
            vec![MessageReceipt::default()],
        );

        f.svc.reconnect_check(&ts5).await.unwrap();

        // the dropped branch's message is pending again
        let lost = f.repo.get_message_by_id(&lost_id).unwrap();
        assert_eq!(lost.state, MessageState::Filled);
        assert_eq!(lost.height, 0);
        // the gap tipset's message landed
        let found = f.repo.get_message_by_id(&found_id).unwrap();
        assert_eq!(found.state, MessageState::OnChain);
        assert_eq!(found.height, 5);
        // journal now mirrors the canonical branch
        assert!(f.svc.tipset_cache.get(4).unwrap().matches(&ts4));
        assert!(f.svc.tipset_cache.get(5).unwrap().matches(&ts5));
        assert_eq!(f.svc.current_head().unwrap().epoch(), 5);
    }

    #[tokio::test]
    async fn reconnect_declares_deep_reorg_fatal() {
        let f = fixture();
        let mut tipsets = vec![mock_tipset(1, 1)];
        for epoch in 2..=1100_i64 {
            let child = mock_tipset_with_parents(tipsets.last().unwrap(), epoch as u64, epoch);
            tipsets.push(child);
        }
        for ts in &tipsets {
            f.node.add_tipset(ts.clone());
        }
        // the journal only knows a tipset the chain never had, far below
        f.svc
            .tipset_cache
            .add(TipsetRecord::from_tipset(&mock_tipset(9999, 50)));

        let err = f
            .svc
            .reconnect_check(tipsets.last().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooDeepReorg(_)));
    }

    #[tokio::test]
    async fn head_change_stream_drives_the_engine() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        f.node.set_head(mock_tipset(1, 90));
        let id = f.push("f0100", MsgMeta::default());
        f.svc.do_push_tick().await.unwrap();
        let filled = f.repo.get_message_by_id(&id).unwrap();
        let ts = f.tipset_executing(2, 100, &[filled]);

        f.svc
            .process_head_change(vec![HeadChange::Apply(ts)])
            .await
            .unwrap();
        assert_eq!(
            f.repo.get_message_by_id(&id).unwrap().state,
            MessageState::OnChain
        );
    }

    #[test]
    fn premium_bump_has_a_floor() {
        assert_eq!(
            bump_premium(&TokenAmount::from_atto(100)),
            TokenAmount::from_atto(125)
        );
        // tiny premiums still move by at least one attoFIL
        assert_eq!(
            bump_premium(&TokenAmount::from_atto(2)),
            TokenAmount::from_atto(3)
        );
        assert_eq!(
            bump_premium(&TokenAmount::from_atto(0)),
            TokenAmount::from_atto(1)
        );
    }
}
