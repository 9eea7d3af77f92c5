// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use super::Result;
use crate::repo::{Error as RepoError, Repo};
use crate::types::{AddressState, Wallet, WalletAddress};
use crate::wallet::{WalletApi, WalletConnector};

/// Wallet records, wallet↔address bindings, and live client handles.
pub struct WalletService {
    repo: Arc<dyn Repo>,
    connector: Box<dyn WalletConnector>,
    clients: RwLock<HashMap<String, Arc<dyn WalletApi>>>,
}

impl WalletService {
    pub fn new(repo: Arc<dyn Repo>, connector: Box<dyn WalletConnector>) -> Self {
        WalletService {
            repo,
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn save_wallet(&self, wallet: &Wallet) -> Result<Uuid> {
        self.repo.transaction(&mut |tx| {
            if tx.wallet_repo().has_wallet(&wallet.name)? {
                return Err(RepoError::already_exists(format!("wallet {}", wallet.name)));
            }
            for existing in tx.wallet_repo().list_wallet()? {
                if existing.url == wallet.url && existing.token == wallet.token {
                    return Err(RepoError::already_exists(format!(
                        "wallet with url {}",
                        wallet.url
                    )));
                }
            }
            tx.wallet_repo().save_wallet(wallet)
        })?;
        info!(wallet = %wallet.name, "wallet saved");
        Ok(wallet.id)
    }

    pub fn get_wallet_by_name(&self, name: &str) -> Result<Wallet> {
        Ok(self.repo.wallet_repo().get_wallet_by_name(name)?)
    }

    pub fn has_wallet(&self, name: &str) -> Result<bool> {
        Ok(self.repo.wallet_repo().has_wallet(name)?)
    }

    pub fn list_wallet(&self) -> Result<Vec<Wallet>> {
        Ok(self.repo.wallet_repo().list_wallet()?)
    }

    pub fn del_wallet(&self, name: &str) -> Result<()> {
        self.repo.wallet_repo().del_wallet(name)?;
        self.clients.write().remove(name);
        info!(wallet = %name, "wallet deleted");
        Ok(())
    }

    /// The signing client for a wallet name, dialing and caching on first
    /// use.
    pub fn get_client(&self, wallet_name: &str) -> Result<Arc<dyn WalletApi>> {
        if let Some(client) = self.clients.read().get(wallet_name) {
            return Ok(client.clone());
        }
        let wallet = self.repo.wallet_repo().get_wallet_by_name(wallet_name)?;
        let client = self.connector.connect(&wallet)?;
        self.clients
            .write()
            .insert(wallet_name.to_string(), client.clone());
        Ok(client)
    }

    /// Whether any registered wallet holds the key, under the caller's
    /// account.
    pub async fn wallet_has(&self, account: &str, addr: &crate::types::Address) -> Result<bool> {
        for wallet in self.list_wallet()? {
            let client = self.get_client(&wallet.name)?;
            if client.wallet_has(account, addr).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn save_wallet_address(&self, wa: &WalletAddress) -> Result<Uuid> {
        self.repo.wallet_address_repo().save_wallet_address(wa)?;
        Ok(wa.id)
    }

    pub fn get_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<WalletAddress> {
        Ok(self
            .repo
            .wallet_address_repo()
            .get_wallet_address(wallet_name, addr_id)?)
    }

    pub fn list_wallet_address(&self) -> Result<Vec<WalletAddress>> {
        Ok(self.repo.wallet_address_repo().list_wallet_address()?)
    }

    pub fn list_by_addr_id(&self, addr_id: &Uuid) -> Result<Vec<WalletAddress>> {
        Ok(self.repo.wallet_address_repo().list_by_addr_id(addr_id)?)
    }

    pub fn update_wallet_address_state(
        &self,
        wallet_name: &str,
        addr_id: &Uuid,
        state: AddressState,
    ) -> Result<()> {
        Ok(self
            .repo
            .wallet_address_repo()
            .update_address_state(wallet_name, addr_id, state)?)
    }

    pub fn update_wallet_address_sel_msg_num(
        &self,
        wallet_name: &str,
        addr_id: &Uuid,
        num: u64,
    ) -> Result<()> {
        Ok(self
            .repo
            .wallet_address_repo()
            .update_select_msg_num(wallet_name, addr_id, num)?)
    }

    pub fn del_wallet_address(&self, wallet_name: &str, addr_id: &Uuid) -> Result<()> {
        Ok(self
            .repo
            .wallet_address_repo()
            .del_wallet_address(wallet_name, addr_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::memory::MemRepo;
    use crate::wallet::testing::{TestConnector, TestWallet};
    use chrono::Utc;

    fn wallet(name: &str, url: &str) -> Wallet {
        let now = Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            token: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn service() -> WalletService {
        let repo = Arc::new(MemRepo::new());
        let connector = TestConnector(Arc::new(TestWallet::new()));
        WalletService::new(repo, Box::new(connector))
    }

    #[test]
    fn rejects_duplicate_name_and_url() {
        let svc = service();
        svc.save_wallet(&wallet("w1", "http://a")).unwrap();
        assert!(svc.save_wallet(&wallet("w1", "http://b")).is_err());
        assert!(svc.save_wallet(&wallet("w2", "http://a")).is_err());
        svc.save_wallet(&wallet("w2", "http://b")).unwrap();
        assert_eq!(svc.list_wallet().unwrap().len(), 2);
    }

    #[test]
    fn binding_round_trip() {
        let svc = service();
        svc.save_wallet(&wallet("w1", "http://a")).unwrap();
        let addr_id = Uuid::new_v4();
        let wa = WalletAddress::new("w1".to_string(), addr_id);
        svc.save_wallet_address(&wa).unwrap();

        let got = svc.get_wallet_address("w1", &addr_id).unwrap();
        assert_eq!(got.addr_state, AddressState::Alive);

        svc.update_wallet_address_state("w1", &addr_id, AddressState::Forbidden)
            .unwrap();
        let got = svc.get_wallet_address("w1", &addr_id).unwrap();
        assert_eq!(got.addr_state, AddressState::Forbidden);
    }
}
