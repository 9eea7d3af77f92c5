// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chooses which unsigned messages to sign next for every managed address,
//! assigns nonces, runs batch gas estimation, and signs through the bound
//! wallets. The selector never writes durable state; its result is applied
//! by the engine in one transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Result, SharedParamsService, WalletService};
use crate::node::{Error as NodeError, EstimateMessage, MessageSendSpec, NodeApi};
use crate::repo::Repo;
use crate::types::{
    Address, AddressInfo, AddressState, Message, MessageState, MsgMeta, SignedMessage, Tipset,
    TokenAmount, UnsignedMessage,
};
use crate::wallet::{SignMeta, SignType};

/// Addresses processed in parallel per selection run.
const SELECT_CONCURRENCY: usize = 10;
/// Candidate fetch never exceeds this, however large the in-flight budget.
const MAX_SELECT_COUNT: u64 = 100;

const STATE_ACTOR_TIMEOUT: Duration = Duration::from_secs(1);
const GAS_ESTIMATE_TIMEOUT: Duration = Duration::from_secs(5);
const WALLET_SIGN_TIMEOUT: Duration = Duration::from_secs(1);

const GAS_ESTIMATE_PREFIX: &str = "gas estimate: ";
const SIGN_MSG_PREFIX: &str = "sign msg: ";

#[derive(Clone, Debug, PartialEq)]
pub struct MsgErrInfo {
    pub id: Uuid,
    pub err: String,
}

#[derive(Default)]
pub struct SelectResult {
    /// Freshly signed this run, state `Filled`.
    pub select_msg: Vec<Message>,
    /// Terminal this run: expired candidates and estimation strike-outs,
    /// each carrying its terminal state.
    pub expire_msg: Vec<Message>,
    /// Already-signed messages that still need (re)broadcasting.
    pub to_push_msg: Vec<SignedMessage>,
    /// Addresses whose nonce advanced; persisted by the engine.
    pub modify_address: Vec<AddressInfo>,
    pub err_msg: Vec<MsgErrInfo>,
}

impl SelectResult {
    fn merge(&mut self, other: SelectResult) {
        self.select_msg.extend(other.select_msg);
        self.expire_msg.extend(other.expire_msg);
        self.to_push_msg.extend(other.to_push_msg);
        self.modify_address.extend(other.modify_address);
        self.err_msg.extend(other.err_msg);
    }
}

pub struct MessageSelector {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeApi>,
    sps: Arc<SharedParamsService>,
    wallet_service: Arc<WalletService>,
    /// Consecutive estimation failures per message id.
    est_failures: Mutex<HashMap<Uuid, u64>>,
}

impl MessageSelector {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeApi>,
        sps: Arc<SharedParamsService>,
        wallet_service: Arc<WalletService>,
    ) -> Self {
        MessageSelector {
            repo,
            node,
            sps,
            wallet_service,
            est_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Select against the given head. Addresses run concurrently, bounded,
    /// and merge into one result.
    pub async fn select_message(&self, ts: &Tipset) -> Result<SelectResult> {
        let mut addr_list = self.repo.address_repo().list_address()?;
        addr_list.sort_by_key(|a| a.weight);
        debug!("{} addresses wait to process", addr_list.len());

        let applied_nonce = self.get_nonce_in_tipset(ts).await?;

        let merged = Mutex::new(SelectResult::default());
        futures::stream::iter(addr_list)
            .for_each_concurrent(Some(SELECT_CONCURRENCY), |addr| {
                let applied_nonce = &applied_nonce;
                let merged = &merged;
                async move {
                    let addr_name = addr.addr.clone();
                    match self.select_addr_message(applied_nonce, addr, ts).await {
                        Ok(result) => merged.lock().merge(result),
                        Err(e) => error!(addr = %addr_name, "select message failed: {e}"),
                    }
                }
            })
            .await;

        Ok(merged.into_inner())
    }

    async fn select_addr_message(
        &self,
        applied_nonce: &HashMap<Address, u64>,
        mut addr: AddressInfo,
        ts: &Tipset,
    ) -> Result<SelectResult> {
        let mut result = SelectResult::default();

        let bindings = self.repo.wallet_address_repo().list_by_addr_id(&addr.id)?;
        if bindings.is_empty() {
            return Err(super::Error::Other(format!(
                "no wallet binding for {}",
                addr.addr
            )));
        }

        let params = self.sps.get_params();
        let mut cap = params.sel_msg_num;
        if addr.sel_msg_num != 0 {
            cap = addr.sel_msg_num;
        }
        if let Some(binding) = bindings.iter().find(|b| b.sel_msg_num != 0) {
            cap = binding.sel_msg_num;
        }

        // 1. nonce reconciliation against the actor, advanced past any
        //    messages the head tipset already carries
        let actor = timeout(
            STATE_ACTOR_TIMEOUT,
            self.node.state_get_actor(&addr.addr, ts.key()),
        )
        .await
        .map_err(|_| NodeError::Timeout("state_get_actor"))??;
        let mut actor_nonce = actor.nonce;
        if let Some(in_ts) = applied_nonce.get(&addr.addr) {
            debug!(addr = %addr.addr, in_ts, actor = actor.nonce, "nonce seen in head tipset");
            actor_nonce = actor_nonce.max(*in_ts);
        }

        let mut nonce_changed = false;
        if actor_nonce > addr.nonce {
            warn!(
                addr = %addr.addr,
                local = addr.nonce,
                chain = actor_nonce,
                "local nonce behind chain, raising"
            );
            addr.nonce = actor_nonce;
            nonce_changed = true;
        }

        // 2. already-signed catch-up: anything at or above the actor nonce
        //    may still land and is worth rebroadcasting
        for msg in self.repo.message_repo().list_filled_message(&addr.addr)? {
            if msg.message.sequence < actor_nonce {
                continue;
            }
            if let Some(smsg) = msg.signed_message() {
                result.to_push_msg.push(smsg);
            }
        }

        // a forbidden sender keeps pushing what it already signed
        if addr.state != AddressState::Alive {
            if nonce_changed {
                result.modify_address.push(addr);
            }
            return Ok(result);
        }

        // 3. in-flight budget
        let in_flight = addr.nonce - actor_nonce;
        if in_flight >= cap {
            info!(addr = %addr.addr, in_flight, cap, "in-flight cap reached");
            if nonce_changed {
                result.modify_address.push(addr);
            }
            return Ok(result);
        }
        let want = cap - in_flight;

        // 4. candidate fetch, expired ones turned terminal
        let select_count = (want * 2).min(MAX_SELECT_COUNT) as usize;
        let candidates = self
            .repo
            .message_repo()
            .list_unchain_message_by_address(&addr.addr, select_count)?;
        let (eligible, expired) = exclude_expired(candidates, ts);
        for mut msg in expired {
            msg.state = MessageState::Expired;
            result.expire_msg.push(msg);
        }

        if eligible.is_empty() {
            debug!(addr = %addr.addr, "no messages to select");
            if nonce_changed {
                result.modify_address.push(addr);
            }
            return Ok(result);
        }

        // 5. batch gas estimation with per-message metas resolved
        let metas: Vec<MsgMeta> = eligible
            .iter()
            .map(|m| self.message_meta(&m.meta, &addr))
            .collect();
        let estimate_msgs: Vec<EstimateMessage> = eligible
            .iter()
            .zip(&metas)
            .map(|(m, meta)| EstimateMessage {
                msg: m.message.clone(),
                spec: MessageSendSpec {
                    max_fee: meta.max_fee.clone(),
                    gas_over_estimation: meta.gas_over_estimation,
                },
            })
            .collect();
        let estimates = timeout(
            GAS_ESTIMATE_TIMEOUT,
            self.node
                .gas_batch_estimate_message_gas(&estimate_msgs, addr.nonce, ts.key()),
        )
        .await
        .map_err(|_| NodeError::Timeout("gas_batch_estimate_message_gas"))??;

        // 6. signing loop; nonces stay contiguous because the first signing
        //    failure stops the whole address for this run
        let max_fail = params.max_est_fail_num_of_msg;
        let mut count: u64 = 0;
        for ((mut msg, meta), estimate) in eligible.into_iter().zip(metas).zip(estimates) {
            if !estimate.err.is_empty() {
                error!(id = %msg.id, "estimate message failed: {}", estimate.err);
                result.err_msg.push(MsgErrInfo {
                    id: msg.id,
                    err: format!("{GAS_ESTIMATE_PREFIX}{}", estimate.err),
                });
                let strikes = {
                    let mut failures = self.est_failures.lock();
                    let entry = failures.entry(msg.id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if strikes > max_fail {
                    self.est_failures.lock().remove(&msg.id);
                    msg.state = MessageState::Failed;
                    result.expire_msg.push(msg);
                }
                continue;
            }
            self.est_failures.lock().remove(&msg.id);

            if count >= want {
                break;
            }

            let binding = match self
                .repo
                .wallet_address_repo()
                .get_wallet_address(&msg.wallet_name, &addr.id)
            {
                Ok(binding) => binding,
                Err(e) => {
                    warn!(id = %msg.id, wallet = %msg.wallet_name, "wallet binding missing: {e}");
                    continue;
                }
            };
            if binding.addr_state != AddressState::Alive {
                info!(
                    wallet = %msg.wallet_name,
                    addr = %addr.addr,
                    state = ?binding.addr_state,
                    "binding not alive, skipping"
                );
                continue;
            }
            let client = match self.wallet_service.get_client(&msg.wallet_name) {
                Ok(client) => client,
                Err(e) => {
                    warn!(wallet = %msg.wallet_name, "no wallet client: {e}");
                    continue;
                }
            };

            msg.message.sequence = addr.nonce;
            msg.message.gas_fee_cap = estimate.msg.gas_fee_cap.clone();
            msg.message.gas_premium = estimate.msg.gas_premium.clone();
            msg.message.gas_limit = estimate.msg.gas_limit;
            cap_gas_fee(&mut msg.message, &meta.max_fee);

            let unsigned_cid = msg.message.cid()?;
            let data = msg.message.marshal_cbor()?;
            let sign_meta = SignMeta {
                sign_type: SignType::ChainMsg,
                extra: data,
            };
            let sig = match timeout(
                WALLET_SIGN_TIMEOUT,
                client.wallet_sign(
                    &msg.wallet_name,
                    &addr.addr,
                    &unsigned_cid.to_bytes(),
                    &sign_meta,
                ),
            )
            .await
            {
                Ok(Ok(sig)) => sig,
                Ok(Err(e)) => {
                    error!(id = %msg.id, "wallet sign failed: {e}");
                    result.err_msg.push(MsgErrInfo {
                        id: msg.id,
                        err: format!("{SIGN_MSG_PREFIX}{e}"),
                    });
                    // later nonces must not be signed out of order
                    break;
                }
                Err(_) => {
                    error!(id = %msg.id, "wallet sign timed out");
                    result.err_msg.push(MsgErrInfo {
                        id: msg.id,
                        err: format!("{SIGN_MSG_PREFIX}timed out"),
                    });
                    break;
                }
            };

            msg.unsigned_cid = Some(unsigned_cid);
            msg.signature = Some(sig);
            msg.state = MessageState::Filled;
            msg.signed_cid = msg.compute_signed_cid();

            result.select_msg.push(msg);
            addr.nonce += 1;
            nonce_changed = true;
            count += 1;
        }

        info!(
            addr = %addr.addr,
            selected = result.select_msg.len(),
            expired = result.expire_msg.len(),
            to_push = result.to_push_msg.len(),
            errors = result.err_msg.len(),
            nonce = addr.nonce,
            "address selection done"
        );
        if nonce_changed {
            result.modify_address.push(addr);
        }
        Ok(result)
    }

    /// Per-message meta with unset fields inherited from the address, then
    /// the shared parameters.
    fn message_meta(&self, meta: &MsgMeta, addr: &AddressInfo) -> MsgMeta {
        let global = self.sps.get_params().msg_meta();
        let mut out = meta.clone();
        if out.gas_over_estimation == 0.0 {
            out.gas_over_estimation = if addr.gas_over_estimation != 0.0 {
                addr.gas_over_estimation
            } else {
                global.gas_over_estimation
            };
        }
        if out.max_fee.is_zero() {
            out.max_fee = if !addr.max_fee.is_zero() {
                addr.max_fee.clone()
            } else {
                global.max_fee
            };
        }
        if out.max_fee_cap.is_zero() {
            out.max_fee_cap = if !addr.max_fee_cap.is_zero() {
                addr.max_fee_cap.clone()
            } else {
                global.max_fee_cap
            };
        }
        out
    }

    /// Next-expected nonce per sender after the head tipset's own messages.
    /// The first message seen for a sender is guaranteed to carry the actor
    /// nonce, the block would not be valid otherwise.
    async fn get_nonce_in_tipset(&self, ts: &Tipset) -> Result<HashMap<Address, u64>> {
        let mut applied: HashMap<Address, u64> = HashMap::new();
        for block in ts.blocks() {
            let block_msgs = self.node.chain_get_block_messages(&block.cid).await?;
            let unsigned = block_msgs.bls_messages.iter();
            let signed = block_msgs.secp_messages.iter().map(|s| &s.message);
            for msg in unsigned.chain(signed) {
                let entry = applied.entry(msg.from.clone()).or_insert(msg.sequence);
                if *entry == msg.sequence {
                    *entry += 1;
                }
            }
        }
        Ok(applied)
    }
}

/// Split candidates into still-eligible and expired against the head height.
/// A message whose expire epoch equals the head height is expired.
fn exclude_expired(msgs: Vec<Message>, ts: &Tipset) -> (Vec<Message>, Vec<Message>) {
    let mut eligible = Vec::new();
    let mut expired = Vec::new();
    for msg in msgs {
        if msg.meta.expire_epoch != 0 && msg.meta.expire_epoch <= ts.epoch() {
            expired.push(msg);
        } else {
            eligible.push(msg);
        }
    }
    (eligible, expired)
}

/// Clamp the total fee to the policy maximum. Callers have completed gas
/// estimation; a zero max fee or zero gas limit leaves the message as-is.
pub fn cap_gas_fee(msg: &mut UnsignedMessage, max_fee: &TokenAmount) {
    if max_fee.is_zero() || msg.gas_limit == 0 {
        return;
    }
    let total = &msg.gas_fee_cap * msg.gas_limit;
    if total <= *max_fee {
        return;
    }
    msg.gas_fee_cap = max_fee / msg.gas_limit;
    msg.gas_premium = TokenAmount::min(msg.gas_premium.clone(), msg.gas_fee_cap.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_api::{
        mock_tipset, TestNode, TEST_GAS_FEE_CAP, TEST_GAS_LIMIT, TEST_GAS_PREMIUM,
    };
    use crate::repo::memory::MemRepo;
    use crate::repo::{AddressRepo, MessageRepo, WalletAddressRepo, WalletRepo};
    use crate::types::{SharedParams, Wallet, WalletAddress};
    use crate::wallet::testing::{TestConnector, TestWallet};
    use chrono::Utc;

    const WALLET: &str = "w1";

    struct Fixture {
        repo: Arc<MemRepo>,
        node: Arc<TestNode>,
        sps: Arc<SharedParamsService>,
        wallet: Arc<TestWallet>,
        selector: MessageSelector,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemRepo::new());
        let node = Arc::new(TestNode::new());
        let sps = Arc::new(SharedParamsService::new(repo.clone()).unwrap());
        let wallet = Arc::new(TestWallet::new());
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
        let selector = MessageSelector::new(
            repo.clone(),
            node.clone(),
            sps.clone(),
            wallet_service,
        );
        Fixture {
            repo,
            node,
            sps,
            wallet,
            selector,
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

        fn queue_message(&self, from: &Address, expire_epoch: i64) -> Message {
            let msg = Message::new(
                UnsignedMessage {
                    from: from.clone(),
                    to: addr("f0999"),
                    value: TokenAmount::from_atto(42),
                    ..Default::default()
                },
                MsgMeta {
                    expire_epoch,
                    ..Default::default()
                },
                WALLET.to_string(),
            );
            self.repo.save_message(&msg).unwrap();
            msg
        }
    }

    #[tokio::test]
    async fn assigns_contiguous_nonces() {
        let f = fixture();
        f.add_address("f0100", 10, 10);
        for _ in 0..3 {
            f.queue_message(&addr("f0100"), 0);
        }

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.select_msg.len(), 3);
        let nonces: Vec<u64> = result
            .select_msg
            .iter()
            .map(|m| m.message.sequence)
            .collect();
        assert_eq!(nonces, vec![10, 11, 12]);
        for msg in &result.select_msg {
            assert_eq!(msg.state, MessageState::Filled);
            assert!(msg.signature.is_some());
            assert!(msg.signed_cid.is_some());
            assert_eq!(msg.message.gas_limit, (TEST_GAS_LIMIT as f64 * 1.25) as i64);
            assert_eq!(
                msg.message.gas_premium,
                TokenAmount::from_atto(TEST_GAS_PREMIUM)
            );
        }
        assert_eq!(result.modify_address.len(), 1);
        assert_eq!(result.modify_address[0].nonce, 13);
    }

    #[tokio::test]
    async fn respects_in_flight_cap() {
        let f = fixture();
        let mut params = f.sps.get_params();
        params.sel_msg_num = 2;
        f.sps.set_params(params).unwrap();

        f.add_address("f0100", 0, 0);
        for _ in 0..5 {
            f.queue_message(&addr("f0100"), 0);
        }

        let ts = mock_tipset(1, 50);
        let first = f.selector.select_message(&ts).await.unwrap();
        assert_eq!(first.select_msg.len(), 2);
        // persist what the engine would
        for msg in &first.select_msg {
            f.repo.update_signed_message_by_id(msg).unwrap();
        }
        f.repo
            .update_nonce(&addr("f0100"), first.modify_address[0].nonce)
            .unwrap();

        // nothing lands: cap reached, only catch-up pushes
        let second = f.selector.select_message(&ts).await.unwrap();
        assert!(second.select_msg.is_empty());
        assert_eq!(second.to_push_msg.len(), 2);

        // nonce 0 lands, one slot opens
        f.node.set_state_nonce(&addr("f0100"), 1);
        let third = f.selector.select_message(&ts).await.unwrap();
        assert_eq!(third.select_msg.len(), 1);
        assert_eq!(third.select_msg[0].message.sequence, 2);
    }

    #[tokio::test]
    async fn sel_msg_num_zero_falls_back_to_global() {
        let f = fixture();
        let mut params = f.sps.get_params();
        params.sel_msg_num = 1;
        f.sps.set_params(params).unwrap();

        // address and binding both leave the cap unset
        f.add_address("f0100", 0, 0);
        for _ in 0..3 {
            f.queue_message(&addr("f0100"), 0);
        }

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.select_msg.len(), 1);
    }

    #[tokio::test]
    async fn expiry_boundary_is_inclusive() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        let at_head = f.queue_message(&addr("f0100"), 50);
        let after_head = f.queue_message(&addr("f0100"), 51);

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.expire_msg.len(), 1);
        assert_eq!(result.expire_msg[0].id, at_head.id);
        assert_eq!(result.expire_msg[0].state, MessageState::Expired);
        assert_eq!(result.select_msg.len(), 1);
        assert_eq!(result.select_msg[0].id, after_head.id);
    }

    #[tokio::test]
    async fn estimation_failures_strike_out() {
        let f = fixture();
        let mut params = f.sps.get_params();
        params.max_est_fail_num_of_msg = 2;
        f.sps.set_params(params).unwrap();

        f.add_address("f0100", 0, 0);
        let doomed = f.queue_message(&addr("f0100"), 0);
        f.node
            .set_estimate_error(&doomed.message.cid().unwrap(), "out of gas");

        let ts = mock_tipset(1, 50);
        // two strikes: reported, not yet terminal
        for _ in 0..2 {
            let result = f.selector.select_message(&ts).await.unwrap();
            assert!(result.select_msg.is_empty());
            assert_eq!(result.err_msg.len(), 1);
            assert!(result.err_msg[0].err.starts_with(GAS_ESTIMATE_PREFIX));
            assert!(result.expire_msg.is_empty());
        }
        // third consecutive failure crosses the threshold
        let result = f.selector.select_message(&ts).await.unwrap();
        assert_eq!(result.expire_msg.len(), 1);
        assert_eq!(result.expire_msg[0].id, doomed.id);
        assert_eq!(result.expire_msg[0].state, MessageState::Failed);

        // the nonce slot was never consumed
        assert!(result.modify_address.is_empty());
    }

    #[tokio::test]
    async fn estimation_recovery_clears_strikes() {
        let f = fixture();
        let mut params = f.sps.get_params();
        params.max_est_fail_num_of_msg = 2;
        f.sps.set_params(params).unwrap();

        f.add_address("f0100", 0, 0);
        let flaky = f.queue_message(&addr("f0100"), 0);
        let cid = flaky.message.cid().unwrap();
        let ts = mock_tipset(1, 50);

        f.node.set_estimate_error(&cid, "transient");
        f.selector.select_message(&ts).await.unwrap();
        f.selector.select_message(&ts).await.unwrap();

        f.node.clear_estimate_error(&cid);
        let ok = f.selector.select_message(&ts).await.unwrap();
        assert_eq!(ok.select_msg.len(), 1);

        // counter starts over after the success
        assert!(f.selector.est_failures.lock().is_empty());
    }

    #[tokio::test]
    async fn sign_failure_breaks_the_address_run() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        for _ in 0..3 {
            f.queue_message(&addr("f0100"), 0);
        }
        f.wallet.fail_with("gateway down");

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert!(result.select_msg.is_empty());
        assert_eq!(result.err_msg.len(), 1);
        assert!(result.err_msg[0].err.starts_with(SIGN_MSG_PREFIX));
        // no partial nonce assignment leaked out
        assert!(result.modify_address.is_empty());

        // recovery signs all three, contiguously
        f.wallet.succeed();
        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        let nonces: Vec<u64> = result
            .select_msg
            .iter()
            .map(|m| m.message.sequence)
            .collect();
        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn tight_max_fee_still_signs_with_zeroed_gas() {
        let f = fixture();
        f.add_address("f0100", 0, 0);
        let mut msg = f.queue_message(&addr("f0100"), 0);
        // max fee far below one gas unit's price
        msg.meta.max_fee = TokenAmount::from_atto(1);
        f.repo.save_message(&msg).unwrap();

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.select_msg.len(), 1);
        let signed = &result.select_msg[0];
        assert_eq!(signed.message.gas_fee_cap, TokenAmount::from_atto(0));
        assert_eq!(signed.message.gas_premium, TokenAmount::from_atto(0));
        assert!(signed.signature.is_some());
    }

    #[tokio::test]
    async fn forbidden_address_pushes_but_never_signs() {
        let f = fixture();
        let info = f.add_address("f0100", 1, 0);
        f.repo
            .update_state(&info.addr, AddressState::Forbidden)
            .unwrap();

        // one already-filled message above the actor nonce
        let mut filled = f.queue_message(&info.addr, 0);
        filled.message.sequence = 0;
        filled.signature = Some(crate::types::Signature::new_secp256k1(vec![9]));
        filled.state = MessageState::Filled;
        filled.signed_cid = filled.compute_signed_cid();
        f.repo.save_message(&filled).unwrap();
        // and one unsigned candidate
        f.queue_message(&info.addr, 0);

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.to_push_msg.len(), 1);
        assert!(result.select_msg.is_empty());
    }

    #[tokio::test]
    async fn forbidden_binding_skips_signing() {
        let f = fixture();
        let info = f.add_address("f0100", 0, 0);
        f.repo
            .update_address_state(WALLET, &info.id, AddressState::Forbidden)
            .unwrap();
        f.queue_message(&info.addr, 0);

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert!(result.select_msg.is_empty());
        assert!(result.err_msg.is_empty());
    }

    #[tokio::test]
    async fn chain_ahead_raises_local_nonce() {
        let f = fixture();
        f.add_address("f0100", 3, 8);

        let result = f.selector.select_message(&mock_tipset(1, 50)).await.unwrap();
        assert_eq!(result.modify_address.len(), 1);
        assert_eq!(result.modify_address[0].nonce, 8);
    }

    #[test]
    fn cap_gas_fee_respects_policy() {
        let mut msg = UnsignedMessage {
            gas_limit: 100,
            gas_fee_cap: TokenAmount::from_atto(TEST_GAS_FEE_CAP),
            gas_premium: TokenAmount::from_atto(TEST_GAS_PREMIUM),
            ..Default::default()
        };
        // generous cap leaves everything alone
        let original = msg.clone();
        cap_gas_fee(&mut msg, &TokenAmount::from_atto(1_000_000_i64));
        assert_eq!(msg, original);

        // tight cap reduces fee cap and clamps premium to it
        cap_gas_fee(&mut msg, &TokenAmount::from_atto(5_000_i64));
        assert_eq!(msg.gas_fee_cap, TokenAmount::from_atto(50));
        assert_eq!(msg.gas_premium, TokenAmount::from_atto(50));

        // zero max fee and zero gas limit are no-ops
        let mut zero_limit = UnsignedMessage::default();
        cap_gas_fee(&mut zero_limit, &TokenAmount::from_atto(5));
        assert_eq!(zero_limit, UnsignedMessage::default());
    }
}
