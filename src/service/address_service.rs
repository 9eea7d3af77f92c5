// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Error, Result, WalletService};
use crate::node::NodeApi;
use crate::repo::{Error as RepoError, Repo};
use crate::types::{Address, AddressInfo, AddressState, MessageState, TipsetKeys, TokenAmount};

struct ResetRequest {
    addr: Address,
    target_nonce: u64,
    resp: oneshot::Sender<Result<u64>>,
}

/// Managed-sender bookkeeping. Nonce resets are funneled through a
/// single-slot coordinator task so at most one runs at a time.
pub struct AddressService {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeApi>,
    wallet_service: Arc<WalletService>,
    reset_tx: mpsc::Sender<ResetRequest>,
    reset_rx: Mutex<Option<mpsc::Receiver<ResetRequest>>>,
}

impl AddressService {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeApi>,
        wallet_service: Arc<WalletService>,
    ) -> Self {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        AddressService {
            repo,
            node,
            wallet_service,
            reset_tx,
            reset_rx: Mutex::new(Some(reset_rx)),
        }
    }

    pub fn save_address(&self, info: &AddressInfo) -> Result<Uuid> {
        self.repo.transaction(&mut |tx| {
            if tx.address_repo().has_address(&info.addr)? {
                return Err(RepoError::already_exists(format!("address {}", info.addr)));
            }
            tx.address_repo().save_address(info)
        })?;
        info!(addr = %info.addr, "address saved");
        Ok(info.id)
    }

    pub fn get_address(&self, addr: &Address) -> Result<AddressInfo> {
        Ok(self.repo.address_repo().get_address(addr)?)
    }

    pub fn has_address(&self, addr: &Address) -> Result<bool> {
        Ok(self.repo.address_repo().has_address(addr)?)
    }

    pub fn list_address(&self) -> Result<Vec<AddressInfo>> {
        Ok(self.repo.address_repo().list_address()?)
    }

    pub fn update_nonce(&self, addr: &Address, nonce: u64) -> Result<()> {
        Ok(self.repo.address_repo().update_nonce(addr, nonce)?)
    }

    pub fn delete_address(&self, addr: &Address) -> Result<()> {
        self.repo.address_repo().del_address(addr)?;
        info!(addr = %addr, "address removed");
        Ok(())
    }

    pub fn forbidden_address(&self, addr: &Address) -> Result<()> {
        self.repo
            .address_repo()
            .update_state(addr, AddressState::Forbidden)?;
        info!(addr = %addr, "address forbidden");
        Ok(())
    }

    pub fn active_address(&self, addr: &Address) -> Result<()> {
        self.repo
            .address_repo()
            .update_state(addr, AddressState::Alive)?;
        info!(addr = %addr, "address activated");
        Ok(())
    }

    pub fn set_select_msg_num(&self, addr: &Address, num: u64) -> Result<()> {
        self.repo.address_repo().update_select_msg_num(addr, num)?;
        info!(addr = %addr, num, "per-address select count set");
        Ok(())
    }

    pub fn set_fee_params(
        &self,
        addr: &Address,
        gas_over_estimation: f64,
        max_fee: TokenAmount,
        max_fee_cap: TokenAmount,
    ) -> Result<()> {
        if !self.has_address(addr)? {
            return Err(Error::AddressNotExists(addr.clone()));
        }
        if gas_over_estimation == 0.0 && max_fee.is_zero() && max_fee_cap.is_zero() {
            return Ok(());
        }
        Ok(self
            .repo
            .address_repo()
            .update_fee_params(addr, gas_over_estimation, max_fee, max_fee_cap)?)
    }

    pub async fn wallet_has(&self, account: &str, addr: &Address) -> Result<bool> {
        self.wallet_service.wallet_has(account, addr).await
    }

    /// Request a serialized nonce reset and wait for the outcome. Returns
    /// the nonce the address was left at.
    pub async fn reset_address(&self, addr: &Address, target_nonce: u64) -> Result<u64> {
        let (resp, rx) = oneshot::channel();
        self.reset_tx
            .send(ResetRequest {
                addr: addr.clone(),
                target_nonce,
                resp,
            })
            .await
            .map_err(|_| Error::Other("reset coordinator stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("reset coordinator dropped request".to_string()))?
    }

    /// Drain reset requests one at a time until shutdown. Must be started
    /// exactly once.
    pub fn start_reset_coordinator(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut rx = self
            .reset_rx
            .lock()
            .take()
            .expect("reset coordinator already started");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    req = rx.recv() => {
                        let Some(req) = req else { break };
                        let res = this.do_reset(&req.addr, req.target_nonce).await;
                        if let Err(e) = &res {
                            warn!(addr = %req.addr, "reset failed: {e}");
                        }
                        let _ = req.resp.send(res);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn do_reset(&self, addr: &Address, target_nonce: u64) -> Result<u64> {
        let info = self.get_address(addr)?;
        let actor = self
            .node
            .state_get_actor(addr, &TipsetKeys::default())
            .await?;

        let target = if target_nonce == 0 {
            actor.nonce
        } else {
            if target_nonce < actor.nonce {
                return Err(Error::InvalidTarget {
                    target: target_nonce,
                    chain: actor.nonce,
                });
            }
            target_nonce
        };
        info!(addr = %addr, target, chain_nonce = actor.nonce, "resetting address");

        if target == info.nonce {
            return Ok(info.nonce);
        }

        let mut latest = info.nonce;
        self.repo.transaction(&mut |tx| {
            let messages = tx.message_repo();
            for nonce in (target..info.nonce).rev() {
                match messages.get_message_by_from_and_nonce(addr, nonce) {
                    Ok(msg) => match msg.state {
                        MessageState::Filled => {
                            messages.mark_bad_message(&msg.id)?;
                            latest = nonce;
                        }
                        // settled; everything below is too
                        MessageState::OnChain => break,
                        _ => {}
                    },
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
            // queued messages would now be assigned stale nonces
            for msg in messages.list_unfilled_message(addr)? {
                messages.mark_bad_message(&msg.id)?;
            }
            if latest < info.nonce {
                tx.address_repo().update_nonce(addr, latest)?;
            }
            Ok(())
        })?;
        info!(addr = %addr, nonce = latest, "address reset");
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_api::TestNode;
    use crate::repo::memory::MemRepo;
    use crate::repo::{AddressRepo, MessageRepo};
    use crate::types::{Message, MsgMeta, Signature, UnsignedMessage};
    use crate::wallet::testing::{TestConnector, TestWallet};

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn stored_message(from: &Address, nonce: u64, state: MessageState) -> Message {
        let mut msg = Message::new(
            UnsignedMessage {
                from: from.clone(),
                to: addr("f0999"),
                sequence: nonce,
                ..Default::default()
            },
            MsgMeta::default(),
            "w1".to_string(),
        );
        msg.state = state;
        if state != MessageState::Unfilled {
            msg.signature = Some(Signature::new_secp256k1(vec![nonce as u8]));
            msg.signed_cid = msg.compute_signed_cid();
        }
        msg
    }

    struct Fixture {
        repo: Arc<MemRepo>,
        node: Arc<TestNode>,
        svc: Arc<AddressService>,
        _coordinator: JoinHandle<()>,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemRepo::new());
        let node = Arc::new(TestNode::new());
        let wallets = Arc::new(WalletService::new(
            repo.clone(),
            Box::new(TestConnector(Arc::new(TestWallet::new()))),
        ));
        let svc = Arc::new(AddressService::new(repo.clone(), node.clone(), wallets));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = svc.start_reset_coordinator(shutdown_rx);
        Fixture {
            repo,
            node,
            svc,
            _coordinator: coordinator,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn reset_to_chain_nonce() {
        let f = fixture();
        let sender = addr("f0100");
        let mut info = AddressInfo::new(sender.clone());
        info.nonce = 20;
        f.repo.save_address(&info).unwrap();
        f.node.set_state_nonce(&sender, 15);

        for nonce in [15, 16] {
            f.repo
                .save_message(&stored_message(&sender, nonce, MessageState::OnChain))
                .unwrap();
        }
        for nonce in [17, 18, 19] {
            f.repo
                .save_message(&stored_message(&sender, nonce, MessageState::Filled))
                .unwrap();
        }
        let queued = stored_message(&sender, 0, MessageState::Unfilled);
        f.repo.save_message(&queued).unwrap();

        let latest = f.svc.reset_address(&sender, 0).await.unwrap();
        assert_eq!(latest, 17);
        assert_eq!(f.repo.get_address(&sender).unwrap().nonce, 17);

        for nonce in [17, 18, 19] {
            let msg = f.repo.get_message_by_from_and_nonce(&sender, nonce).unwrap();
            assert_eq!(msg.state, MessageState::Failed);
        }
        for nonce in [15, 16] {
            let msg = f.repo.get_message_by_from_and_nonce(&sender, nonce).unwrap();
            assert_eq!(msg.state, MessageState::OnChain);
        }
        assert_eq!(
            f.repo.get_message_by_id(&queued.id).unwrap().state,
            MessageState::Failed
        );
    }

    #[tokio::test]
    async fn reset_rejects_target_below_chain() {
        let f = fixture();
        let sender = addr("f0100");
        let mut info = AddressInfo::new(sender.clone());
        info.nonce = 20;
        f.repo.save_address(&info).unwrap();
        f.node.set_state_nonce(&sender, 15);

        let err = f.svc.reset_address(&sender, 10).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTarget {
                target: 10,
                chain: 15
            }
        ));
    }

    #[tokio::test]
    async fn reset_to_current_nonce_is_noop() {
        let f = fixture();
        let sender = addr("f0100");
        let mut info = AddressInfo::new(sender.clone());
        info.nonce = 15;
        f.repo.save_address(&info).unwrap();
        f.node.set_state_nonce(&sender, 15);

        let queued = stored_message(&sender, 0, MessageState::Unfilled);
        f.repo.save_message(&queued).unwrap();

        let latest = f.svc.reset_address(&sender, 15).await.unwrap();
        assert_eq!(latest, 15);
        assert_eq!(
            f.repo.get_message_by_id(&queued.id).unwrap().state,
            MessageState::Unfilled
        );
    }

    #[tokio::test]
    async fn duplicate_address_rejected() {
        let f = fixture();
        let info = AddressInfo::new(addr("f0100"));
        f.svc.save_address(&info).unwrap();
        assert!(f.svc.save_address(&info).is_err());
    }

    #[tokio::test]
    async fn state_toggles() {
        let f = fixture();
        let sender = addr("f0100");
        f.svc.save_address(&AddressInfo::new(sender.clone())).unwrap();

        f.svc.forbidden_address(&sender).unwrap();
        assert_eq!(
            f.svc.get_address(&sender).unwrap().state,
            AddressState::Forbidden
        );
        f.svc.active_address(&sender).unwrap();
        assert_eq!(
            f.svc.get_address(&sender).unwrap().state,
            AddressState::Alive
        );
    }
}
