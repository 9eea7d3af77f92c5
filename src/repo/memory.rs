// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory store with snapshot-and-swap transactions. Backs the test suite
//! and single-process deployments; a durable backend implements the same
//! traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cid::Cid;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    AddressRepo, Error, FeeConfigRepo, MessageRepo, NodeRepo, Repo, Result, SharedParamsRepo,
    TxFn, WalletAddressRepo, WalletRepo,
};
use crate::types::{
    Address, AddressInfo, AddressState, ChainEpoch, FeeConfig, Message, MessageReceipt,
    MessageState, Node, SharedParams, TokenAmount, Wallet, WalletAddress,
};

#[derive(Default, Clone)]
struct Store {
    messages: HashMap<Uuid, Message>,
    addresses: BTreeMap<String, AddressInfo>,
    wallet_addresses: HashMap<(String, Uuid), WalletAddress>,
    wallets: BTreeMap<String, Wallet>,
    nodes: BTreeMap<String, Node>,
    fee_configs: HashMap<Uuid, FeeConfig>,
    shared_params: Option<SharedParams>,
}

pub struct MemRepo {
    store: Arc<RwLock<Store>>,
    tx_lock: Arc<Mutex<()>>,
    in_tx: bool,
}

impl MemRepo {
    pub fn new() -> Self {
        MemRepo {
            store: Arc::new(RwLock::new(Store::default())),
            tx_lock: Arc::new(Mutex::new(())),
            in_tx: false,
        }
    }
}

impl Default for MemRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_creation(mut msgs: Vec<Message>) -> Vec<Message> {
    msgs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    msgs
}

impl MessageRepo for MemRepo {
    fn save_message(&self, msg: &Message) -> Result<()> {
        self.store.write().messages.insert(msg.id, msg.clone());
        Ok(())
    }

    fn batch_save_message(&self, msgs: &[Message]) -> Result<()> {
        let mut store = self.store.write();
        for msg in msgs {
            store.messages.insert(msg.id, msg.clone());
        }
        Ok(())
    }

    fn has_message_by_id(&self, id: &Uuid) -> Result<bool> {
        Ok(self.store.read().messages.contains_key(id))
    }

    fn get_message_by_id(&self, id: &Uuid) -> Result<Message> {
        self.store
            .read()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("message {id}")))
    }

    fn get_message_by_unsigned_cid(&self, cid: &Cid) -> Result<Message> {
        self.store
            .read()
            .messages
            .values()
            .find(|m| m.unsigned_cid.as_ref() == Some(cid))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("message with unsigned cid {cid}")))
    }

    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message> {
        self.store
            .read()
            .messages
            .values()
            .find(|m| m.signed_cid.as_ref() == Some(cid))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("message with signed cid {cid}")))
    }

    fn get_message_by_from_and_nonce(&self, from: &Address, nonce: u64) -> Result<Message> {
        self.store
            .read()
            .messages
            .values()
            .find(|m| {
                &m.message.from == from
                    && m.message.sequence == nonce
                    && m.state != MessageState::Unfilled
            })
            .cloned()
            .ok_or_else(|| Error::not_found(format!("message from {from} nonce {nonce}")))
    }

    fn get_signed_messages_by_height(&self, height: ChainEpoch) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| m.state == MessageState::OnChain && m.height == height)
                .cloned()
                .collect(),
        ))
    }

    fn list_message(&self) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store.read().messages.values().cloned().collect(),
        ))
    }

    fn list_message_by_address(&self, addr: &Address) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| &m.message.from == addr)
                .cloned()
                .collect(),
        ))
    }

    fn list_message_by_from_state(
        &self,
        from: &Address,
        state: MessageState,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        let msgs = sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| &m.message.from == from && m.state == state)
                .cloned()
                .collect(),
        );
        let skip = page_index.saturating_sub(1) * page_size;
        Ok(msgs.into_iter().skip(skip).take(page_size).collect())
    }

    fn list_unfilled_message(&self, addr: &Address) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| &m.message.from == addr && m.state == MessageState::Unfilled)
                .cloned()
                .collect(),
        ))
    }

    fn list_filled_message(&self, addr: &Address) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| &m.message.from == addr && m.state == MessageState::Filled)
                .cloned()
                .collect(),
        ))
    }

    fn list_all_filled_message(&self) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| m.state == MessageState::Filled)
                .cloned()
                .collect(),
        ))
    }

    fn list_unchain_message_by_address(
        &self,
        addr: &Address,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut msgs: Vec<Message> = self
            .store
            .read()
            .messages
            .values()
            .filter(|m| &m.message.from == addr && m.state == MessageState::Unfilled)
            .cloned()
            .collect();
        // expire epoch ascending, zero (no expiry) last
        msgs.sort_by_key(|m| {
            (
                m.meta.expire_epoch == 0,
                m.meta.expire_epoch,
                m.created_at,
                m.id,
            )
        });
        msgs.truncate(limit);
        Ok(msgs)
    }

    fn list_blocked_message(&self, addr: &Address, older_than: Duration) -> Result<Vec<Message>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::Other(e.to_string()))?;
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| {
                    &m.message.from == addr
                        && m.state == MessageState::Filled
                        && m.updated_at < cutoff
                })
                .cloned()
                .collect(),
        ))
    }

    fn list_failed_message(&self) -> Result<Vec<Message>> {
        Ok(sorted_by_creation(
            self.store
                .read()
                .messages
                .values()
                .filter(|m| m.state == MessageState::Failed)
                .cloned()
                .collect(),
        ))
    }

    fn update_message_state_by_id(&self, id: &Uuid, state: MessageState) -> Result<()> {
        let mut store = self.store.write();
        let msg = store
            .messages
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("message {id}")))?;
        msg.state = state;
        msg.updated_at = Utc::now();
        Ok(())
    }

    fn update_message_state_by_cid(&self, signed_cid: &Cid, state: MessageState) -> Result<()> {
        let mut store = self.store.write();
        let msg = store
            .messages
            .values_mut()
            .find(|m| m.signed_cid.as_ref() == Some(signed_cid))
            .ok_or_else(|| Error::not_found(format!("message with signed cid {signed_cid}")))?;
        msg.state = state;
        msg.updated_at = Utc::now();
        Ok(())
    }

    fn update_signed_message_by_id(&self, msg: &Message) -> Result<()> {
        let mut store = self.store.write();
        let stored = store
            .messages
            .get_mut(&msg.id)
            .ok_or_else(|| Error::not_found(format!("message {}", msg.id)))?;
        stored.message = msg.message.clone();
        stored.signature = msg.signature.clone();
        stored.unsigned_cid = msg.unsigned_cid;
        stored.signed_cid = msg.signed_cid;
        stored.state = msg.state;
        stored.updated_at = Utc::now();
        Ok(())
    }

    fn update_message_receipt(
        &self,
        signed_cid: &Cid,
        receipt: Option<MessageReceipt>,
        height: ChainEpoch,
        state: MessageState,
    ) -> Result<()> {
        let mut store = self.store.write();
        let msg = store
            .messages
            .values_mut()
            .find(|m| m.signed_cid.as_ref() == Some(signed_cid))
            .ok_or_else(|| Error::not_found(format!("message with signed cid {signed_cid}")))?;
        msg.receipt = receipt;
        msg.height = height;
        msg.state = state;
        msg.updated_at = Utc::now();
        Ok(())
    }

    fn update_message_error(&self, id: &Uuid, error: &str) -> Result<()> {
        let mut store = self.store.write();
        let msg = store
            .messages
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("message {id}")))?;
        msg.error = Some(error.to_string());
        msg.updated_at = Utc::now();
        Ok(())
    }

    fn mark_bad_message(&self, id: &Uuid) -> Result<()> {
        self.update_message_state_by_id(id, MessageState::Failed)
    }

    fn expire_messages(&self, msgs: &[Message]) -> Result<()> {
        let mut store = self.store.write();
        for msg in msgs {
            let mut record = msg.clone();
            record.updated_at = Utc::now();
            store.messages.insert(record.id, record);
        }
        Ok(())
    }
}

impl AddressRepo for MemRepo {
    fn save_address(&self, info: &AddressInfo) -> Result<()> {
        self.store
            .write()
            .addresses
            .insert(info.addr.to_string(), info.clone());
        Ok(())
    }

    fn get_address(&self, addr: &Address) -> Result<AddressInfo> {
        self.store
            .read()
            .addresses
            .get(addr.as_str())
            .filter(|a| a.state != AddressState::Removed)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("address {addr}")))
    }

    fn get_address_by_id(&self, id: &Uuid) -> Result<AddressInfo> {
        self.store
            .read()
            .addresses
            .values()
            .find(|a| &a.id == id && a.state != AddressState::Removed)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("address id {id}")))
    }

    fn has_address(&self, addr: &Address) -> Result<bool> {
        Ok(self
            .store
            .read()
            .addresses
            .get(addr.as_str())
            .map(|a| a.state != AddressState::Removed)
            .unwrap_or(false))
    }

    fn list_address(&self) -> Result<Vec<AddressInfo>> {
        Ok(self
            .store
            .read()
            .addresses
            .values()
            .filter(|a| a.state != AddressState::Removed)
            .cloned()
            .collect())
    }

    fn update_nonce(&self, addr: &Address, nonce: u64) -> Result<()> {
        self.with_address(addr, |a| a.nonce = nonce)
    }

    fn update_state(&self, addr: &Address, state: AddressState) -> Result<()> {
        self.with_address(addr, |a| a.state = state)
    }

    fn update_select_msg_num(&self, addr: &Address, num: u64) -> Result<()> {
        self.with_address(addr, |a| a.sel_msg_num = num)
    }

    fn update_fee_params(
        &self,
        addr: &Address,
        gas_over_estimation: f64,
        max_fee: TokenAmount,
        max_fee_cap: TokenAmount,
    ) -> Result<()> {
        self.with_address(addr, |a| {
            if gas_over_estimation != 0.0 {
                a.gas_over_estimation = gas_over_estimation;
            }
            if !max_fee.is_zero() {
                a.max_fee = max_fee.clone();
            }
            if !max_fee_cap.is_zero() {
                a.max_fee_cap = max_fee_cap.clone();
            }
        })
    }

    fn del_address(&self, addr: &Address) -> Result<()> {
        self.with_address(addr, |a| a.state = AddressState::Removed)
    }
}

impl MemRepo {
    fn with_address(&self, addr: &Address, f: impl Fn(&mut AddressInfo)) -> Result<()> {
        let mut store = self.store.write();
        let info = store
            .addresses
            .get_mut(addr.as_str())
            .ok_or_else(|| Error::not_found(format!("address {addr}")))?;
        f(info);
        info.updated_at = Utc::now();
        Ok(())
    }

    fn with_wallet_address(
        &self,
        wallet_name: &str,
        addr_id: &Uuid,
        f: impl Fn(&mut WalletAddress),
    ) -> Result<()> {
        let mut store = self.store.write();
        let wa = store
            .wallet_addresses
            .get_mut(&(wallet_name.to_string(), *addr_id))
            .ok_or_else(|| {
                Error::not_found(format!("wallet address {wallet_name}:{addr_id}"))
            })?;
        f(wa);
        wa.updated_at = Utc::now();
        Ok(())
    }
}

impl WalletAddressRepo for MemRepo {
    fn save_wallet_address(&self, wa: &WalletAddress) -> Result<()> {
        self.store
            .write()
            .wallet_addresses
            .insert((wa.wallet_name.clone(), wa.addr_id), wa.clone());
        Ok(())
    }

    fn get_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<WalletAddress> {
        self.store
            .read()
            .wallet_addresses
            .get(&(wallet_name.to_string(), *addr_id))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("wallet address {wallet_name}:{addr_id}")))
    }

    fn list_wallet_address(&self) -> Result<Vec<WalletAddress>> {
        let mut list: Vec<WalletAddress> = self
            .store
            .read()
            .wallet_addresses
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| (&a.wallet_name, a.addr_id).cmp(&(&b.wallet_name, b.addr_id)));
        Ok(list)
    }

    fn list_by_addr_id(&self, addr_id: &Uuid) -> Result<Vec<WalletAddress>> {
        let mut list: Vec<WalletAddress> = self
            .store
            .read()
            .wallet_addresses
            .values()
            .filter(|wa| &wa.addr_id == addr_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.wallet_name.cmp(&b.wallet_name));
        Ok(list)
    }

    fn update_address_state(
        &self,
        wallet_name: &str,
        addr_id: &Uuid,
        state: AddressState,
    ) -> Result<()> {
        self.with_wallet_address(wallet_name, addr_id, |wa| wa.addr_state = state)
    }

    fn update_select_msg_num(&self, wallet_name: &str, addr_id: &Uuid, num: u64) -> Result<()> {
        self.with_wallet_address(wallet_name, addr_id, |wa| wa.sel_msg_num = num)
    }

    fn del_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<()> {
        self.store
            .write()
            .wallet_addresses
            .remove(&(wallet_name.to_string(), *addr_id))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("wallet address {wallet_name}:{addr_id}")))
    }
}

impl WalletRepo for MemRepo {
    fn save_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.store
            .write()
            .wallets
            .insert(wallet.name.clone(), wallet.clone());
        Ok(())
    }

    fn get_wallet_by_name(&self, name: &str) -> Result<Wallet> {
        self.store
            .read()
            .wallets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("wallet {name}")))
    }

    fn has_wallet(&self, name: &str) -> Result<bool> {
        Ok(self.store.read().wallets.contains_key(name))
    }

    fn list_wallet(&self) -> Result<Vec<Wallet>> {
        Ok(self.store.read().wallets.values().cloned().collect())
    }

    fn del_wallet(&self, name: &str) -> Result<()> {
        self.store
            .write()
            .wallets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("wallet {name}")))
    }
}

impl NodeRepo for MemRepo {
    fn save_node(&self, node: &Node) -> Result<()> {
        self.store
            .write()
            .nodes
            .insert(node.name.clone(), node.clone());
        Ok(())
    }

    fn get_node(&self, name: &str) -> Result<Node> {
        self.store
            .read()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {name}")))
    }

    fn has_node(&self, name: &str) -> Result<bool> {
        Ok(self.store.read().nodes.contains_key(name))
    }

    fn list_node(&self) -> Result<Vec<Node>> {
        Ok(self.store.read().nodes.values().cloned().collect())
    }

    fn del_node(&self, name: &str) -> Result<()> {
        self.store
            .write()
            .nodes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("node {name}")))
    }
}

impl FeeConfigRepo for MemRepo {
    fn save_fee_config(&self, cfg: &FeeConfig) -> Result<()> {
        self.store.write().fee_configs.insert(cfg.id, cfg.clone());
        Ok(())
    }

    fn get_fee_config(&self, wallet_id: &Uuid, method: u64) -> Result<FeeConfig> {
        self.store
            .read()
            .fee_configs
            .values()
            .find(|c| &c.wallet_id == wallet_id && c.method == method)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("fee config {wallet_id}:{method}")))
    }

    fn list_fee_config(&self) -> Result<Vec<FeeConfig>> {
        Ok(self.store.read().fee_configs.values().cloned().collect())
    }

    fn del_fee_config(&self, id: &Uuid) -> Result<()> {
        self.store
            .write()
            .fee_configs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("fee config {id}")))
    }
}

impl SharedParamsRepo for MemRepo {
    fn get_shared_params(&self) -> Result<Option<SharedParams>> {
        Ok(self.store.read().shared_params.clone())
    }

    fn set_shared_params(&self, params: &SharedParams) -> Result<()> {
        self.store.write().shared_params = Some(params.clone());
        Ok(())
    }
}

impl Repo for MemRepo {
    fn message_repo(&self) -> &dyn MessageRepo {
        self
    }

    fn address_repo(&self) -> &dyn AddressRepo {
        self
    }

    fn wallet_address_repo(&self) -> &dyn WalletAddressRepo {
        self
    }

    fn wallet_repo(&self) -> &dyn WalletRepo {
        self
    }

    fn node_repo(&self) -> &dyn NodeRepo {
        self
    }

    fn fee_config_repo(&self) -> &dyn FeeConfigRepo {
        self
    }

    fn shared_params_repo(&self) -> &dyn SharedParamsRepo {
        self
    }

    fn transaction(&self, f: TxFn<'_>) -> Result<()> {
        if self.in_tx {
            // already scoped, run inline
            return f(self);
        }
        let _guard = self.tx_lock.lock();
        let snapshot = self.store.read().clone();
        let tx = MemRepo {
            store: Arc::new(RwLock::new(snapshot)),
            tx_lock: self.tx_lock.clone(),
            in_tx: true,
        };
        f(&tx)?;
        let staged = tx.store.read().clone();
        *self.store.write() = staged;
        Ok(())
    }
}
