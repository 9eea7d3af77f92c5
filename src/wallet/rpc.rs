// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

use super::{Error, Result, SignMeta, WalletApi};
use crate::types::{Address, Signature};

/// A remote wallet gateway spoken to over JSON-RPC with a bearer token.
pub struct RpcWallet {
    client: HttpClient,
}

impl RpcWallet {
    pub fn connect(url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Other(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .build(url)
            .map_err(|e| Error::Api(e.to_string()))?;
        Ok(RpcWallet { client })
    }
}

#[async_trait]
impl WalletApi for RpcWallet {
    async fn wallet_has(&self, account: &str, addr: &Address) -> Result<bool> {
        self.client
            .request("Filecoin.WalletHas", rpc_params![account, addr])
            .await
            .map_err(|e| Error::Api(e.to_string()))
    }

    async fn wallet_sign(
        &self,
        account: &str,
        addr: &Address,
        to_sign: &[u8],
        meta: &SignMeta,
    ) -> Result<Signature> {
        self.client
            .request(
                "Filecoin.WalletSign",
                rpc_params![account, addr, to_sign, meta],
            )
            .await
            .map_err(|e| Error::Signing(e.to_string()))
    }
}
