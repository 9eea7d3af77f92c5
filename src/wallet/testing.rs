// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic wallet double for the service tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Error, Result, SignMeta, WalletApi, WalletConnector};
use crate::types::{Address, Signature, Wallet};

#[derive(Default)]
struct Inner {
    keys: HashSet<Address>,
    fail: Option<String>,
    signed: u64,
}

#[derive(Default)]
pub struct TestWallet {
    inner: Mutex<Inner>,
}

impl TestWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, addr: &Address) {
        self.inner.lock().keys.insert(addr.clone());
    }

    /// Make every subsequent sign call fail with `err`.
    pub fn fail_with(&self, err: &str) {
        self.inner.lock().fail = Some(err.to_string());
    }

    pub fn succeed(&self) {
        self.inner.lock().fail = None;
    }

    pub fn signed_count(&self) -> u64 {
        self.inner.lock().signed
    }
}

#[async_trait]
impl WalletApi for TestWallet {
    async fn wallet_has(&self, _account: &str, addr: &Address) -> Result<bool> {
        Ok(self.inner.lock().keys.contains(addr))
    }

    async fn wallet_sign(
        &self,
        _account: &str,
        addr: &Address,
        to_sign: &[u8],
        _meta: &SignMeta,
    ) -> Result<Signature> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.fail {
            return Err(Error::Signing(err.clone()));
        }
        if !inner.keys.contains(addr) {
            return Err(Error::Signing(format!("no key for {addr}")));
        }
        inner.signed += 1;
        // deterministic fake signature: address bytes then payload
        let mut bytes = addr.as_str().as_bytes().to_vec();
        bytes.extend_from_slice(to_sign);
        Ok(Signature::new_secp256k1(bytes))
    }
}

/// Connector handing every wallet record the same shared double.
pub struct TestConnector(pub Arc<TestWallet>);

impl WalletConnector for TestConnector {
    fn connect(&self, _wallet: &Wallet) -> Result<Arc<dyn WalletApi>> {
        Ok(self.0.clone())
    }
}
