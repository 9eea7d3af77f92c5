// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! JSON-RPC surface. Every method carries an access tag in
//! [`method_permission`]; the [`auth_layer`] middleware enforces it against
//! the caller's JWT.

pub mod auth_layer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::middleware::rpc::RpcServiceBuilder;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::{ErrorObject, ErrorObjectOwned};
use uuid::Uuid;

use crate::service::{
    AddressService, Error as ServiceError, MessageService, NodeService, SharedParamsService,
    WalletService,
};
use crate::types::{
    Address, AddressInfo, AddressState, Message, MessageState, MsgMeta, Node, SharedParams,
    TokenAmount, UnsignedMessage, Wallet, WalletAddress,
};

pub use auth_layer::{AuthHeaderLayer, AuthLayer};

const SERVICE_ERROR_CODE: i32 = -32000;

/// Access tag required for an RPC method. Unknown methods demand `admin`.
pub fn method_permission(method: &str) -> &'static str {
    match method {
        "Messager.HasMessageByUid"
        | "Messager.GetMessageByUid"
        | "Messager.GetMessageState"
        | "Messager.GetMessageByCid"
        | "Messager.GetMessageBySignedCid"
        | "Messager.GetMessageByUnsignedCid"
        | "Messager.GetMessageByFromAndNonce"
        | "Messager.ListMessage"
        | "Messager.ListMessageByAddress"
        | "Messager.ListMessageByFromState"
        | "Messager.ListFailedMessage"
        | "Messager.ListBlockedMessage"
        | "Messager.WaitMessage"
        | "Messager.GetAddress"
        | "Messager.HasAddress"
        | "Messager.WalletHas"
        | "Messager.ListAddress"
        | "Messager.GetSharedParams"
        | "Messager.ListWallet"
        | "Messager.ListWalletAddress"
        | "Messager.ListNode" => "read",
        "Messager.PushMessage"
        | "Messager.PushMessageWithId"
        | "Messager.ReplaceMessage"
        | "Messager.RepublishMessage"
        | "Messager.MarkBadMessage"
        | "Messager.UpdateMessageStateByID"
        | "Messager.UpdateAllFilledMessage"
        | "Messager.UpdateFilledMessageByID"
        | "Messager.SaveAddress"
        | "Messager.SetSelectMsgNum"
        | "Messager.SetFeeParams" => "write",
        _ => "admin",
    }
}

#[rpc(server)]
pub trait MessagerApi {
    // ---- messages
    #[method(name = "Messager.PushMessage")]
    async fn push_message(
        &self,
        msg: UnsignedMessage,
        meta: MsgMeta,
        wallet_name: String,
    ) -> RpcResult<Uuid>;
    #[method(name = "Messager.PushMessageWithId")]
    async fn push_message_with_id(
        &self,
        id: Uuid,
        msg: UnsignedMessage,
        meta: MsgMeta,
        wallet_name: String,
    ) -> RpcResult<Uuid>;
    #[method(name = "Messager.HasMessageByUid")]
    async fn has_message_by_uid(&self, id: Uuid) -> RpcResult<bool>;
    #[method(name = "Messager.GetMessageByUid")]
    async fn get_message_by_uid(&self, id: Uuid) -> RpcResult<Message>;
    #[method(name = "Messager.GetMessageState")]
    async fn get_message_state(&self, id: Uuid) -> RpcResult<MessageState>;
    #[method(name = "Messager.GetMessageByCid")]
    async fn get_message_by_cid(&self, cid: Cid) -> RpcResult<Message>;
    #[method(name = "Messager.GetMessageBySignedCid")]
    async fn get_message_by_signed_cid(&self, cid: Cid) -> RpcResult<Message>;
    #[method(name = "Messager.GetMessageByUnsignedCid")]
    async fn get_message_by_unsigned_cid(&self, cid: Cid) -> RpcResult<Message>;
    #[method(name = "Messager.GetMessageByFromAndNonce")]
    async fn get_message_by_from_and_nonce(&self, from: Address, nonce: u64)
        -> RpcResult<Message>;
    #[method(name = "Messager.ListMessage")]
    async fn list_message(&self) -> RpcResult<Vec<Message>>;
    #[method(name = "Messager.ListMessageByAddress")]
    async fn list_message_by_address(&self, addr: Address) -> RpcResult<Vec<Message>>;
    #[method(name = "Messager.ListMessageByFromState")]
    async fn list_message_by_from_state(
        &self,
        from: Address,
        state: MessageState,
        page_index: usize,
        page_size: usize,
    ) -> RpcResult<Vec<Message>>;
    #[method(name = "Messager.ListFailedMessage")]
    async fn list_failed_message(&self) -> RpcResult<Vec<Message>>;
    #[method(name = "Messager.ListBlockedMessage")]
    async fn list_blocked_message(
        &self,
        addr: Address,
        older_than_secs: u64,
    ) -> RpcResult<Vec<Message>>;
    #[method(name = "Messager.WaitMessage")]
    async fn wait_message(&self, id: Uuid, confidence: u64) -> RpcResult<Message>;
    #[method(name = "Messager.ReplaceMessage")]
    async fn replace_message(
        &self,
        id: Uuid,
        auto: bool,
        max_fee: TokenAmount,
        gas_limit: i64,
        gas_premium: TokenAmount,
        gas_fee_cap: TokenAmount,
    ) -> RpcResult<Cid>;
    #[method(name = "Messager.RepublishMessage")]
    async fn republish_message(&self, id: Uuid) -> RpcResult<()>;
    #[method(name = "Messager.MarkBadMessage")]
    async fn mark_bad_message(&self, id: Uuid) -> RpcResult<()>;
    #[method(name = "Messager.UpdateMessageStateByID")]
    async fn update_message_state_by_id(&self, id: Uuid, state: MessageState) -> RpcResult<()>;
    #[method(name = "Messager.UpdateAllFilledMessage")]
    async fn update_all_filled_message(&self) -> RpcResult<usize>;
    #[method(name = "Messager.UpdateFilledMessageByID")]
    async fn update_filled_message_by_id(&self, id: Uuid) -> RpcResult<Uuid>;

    // ---- addresses
    #[method(name = "Messager.SaveAddress")]
    async fn save_address(&self, info: AddressInfo) -> RpcResult<Uuid>;
    #[method(name = "Messager.GetAddress")]
    async fn get_address(&self, addr: Address) -> RpcResult<AddressInfo>;
    #[method(name = "Messager.HasAddress")]
    async fn has_address(&self, addr: Address) -> RpcResult<bool>;
    #[method(name = "Messager.WalletHas")]
    async fn wallet_has(&self, account: String, addr: Address) -> RpcResult<bool>;
    #[method(name = "Messager.ListAddress")]
    async fn list_address(&self) -> RpcResult<Vec<AddressInfo>>;
    #[method(name = "Messager.DeleteAddress")]
    async fn delete_address(&self, addr: Address) -> RpcResult<()>;
    #[method(name = "Messager.ForbiddenAddress")]
    async fn forbidden_address(&self, addr: Address) -> RpcResult<()>;
    #[method(name = "Messager.ActiveAddress")]
    async fn active_address(&self, addr: Address) -> RpcResult<()>;
    #[method(name = "Messager.SetSelectMsgNum")]
    async fn set_select_msg_num(&self, addr: Address, num: u64) -> RpcResult<()>;
    #[method(name = "Messager.SetFeeParams")]
    async fn set_fee_params(
        &self,
        addr: Address,
        gas_over_estimation: f64,
        max_fee: TokenAmount,
        max_fee_cap: TokenAmount,
    ) -> RpcResult<()>;
    #[method(name = "Messager.ResetAddress")]
    async fn reset_address(&self, addr: Address, target_nonce: u64) -> RpcResult<u64>;

    // ---- shared params
    #[method(name = "Messager.GetSharedParams")]
    async fn get_shared_params(&self) -> RpcResult<SharedParams>;
    #[method(name = "Messager.SetSharedParams")]
    async fn set_shared_params(&self, params: SharedParams) -> RpcResult<()>;

    // ---- wallets
    #[method(name = "Messager.SaveWallet")]
    async fn save_wallet(&self, wallet: Wallet) -> RpcResult<Uuid>;
    #[method(name = "Messager.ListWallet")]
    async fn list_wallet(&self) -> RpcResult<Vec<Wallet>>;
    #[method(name = "Messager.DelWallet")]
    async fn del_wallet(&self, name: String) -> RpcResult<()>;
    #[method(name = "Messager.SaveWalletAddress")]
    async fn save_wallet_address(&self, wa: WalletAddress) -> RpcResult<Uuid>;
    #[method(name = "Messager.ListWalletAddress")]
    async fn list_wallet_address(&self) -> RpcResult<Vec<WalletAddress>>;
    #[method(name = "Messager.UpdateWalletAddressState")]
    async fn update_wallet_address_state(
        &self,
        wallet_name: String,
        addr_id: Uuid,
        state: AddressState,
    ) -> RpcResult<()>;
    #[method(name = "Messager.DelWalletAddress")]
    async fn del_wallet_address(&self, wallet_name: String, addr_id: Uuid) -> RpcResult<()>;

    // ---- nodes
    #[method(name = "Messager.SaveNode")]
    async fn save_node(&self, node: Node) -> RpcResult<()>;
    #[method(name = "Messager.ListNode")]
    async fn list_node(&self) -> RpcResult<Vec<Node>>;
    #[method(name = "Messager.DeleteNode")]
    async fn delete_node(&self, name: String) -> RpcResult<()>;
}

fn to_rpc_err(e: ServiceError) -> ErrorObjectOwned {
    ErrorObject::owned(SERVICE_ERROR_CODE, e.to_string(), None::<()>)
}

pub struct MessagerApiImpl {
    pub message_service: Arc<MessageService>,
    pub address_service: Arc<AddressService>,
    pub wallet_service: Arc<WalletService>,
    pub node_service: Arc<NodeService>,
    pub sps: Arc<SharedParamsService>,
}

#[jsonrpsee::core::async_trait]
impl MessagerApiServer for MessagerApiImpl {
    async fn push_message(
        &self,
        msg: UnsignedMessage,
        meta: MsgMeta,
        wallet_name: String,
    ) -> RpcResult<Uuid> {
        self.message_service
            .push_message(msg, meta, wallet_name)
            .map_err(to_rpc_err)
    }

    async fn push_message_with_id(
        &self,
        id: Uuid,
        msg: UnsignedMessage,
        meta: MsgMeta,
        wallet_name: String,
    ) -> RpcResult<Uuid> {
        self.message_service
            .push_message_with_id(id, msg, meta, wallet_name)
            .map_err(to_rpc_err)
    }

    async fn has_message_by_uid(&self, id: Uuid) -> RpcResult<bool> {
        self.message_service
            .has_message_by_uid(&id)
            .map_err(to_rpc_err)
    }

    async fn get_message_by_uid(&self, id: Uuid) -> RpcResult<Message> {
        self.message_service
            .get_message_by_uid(&id)
            .map_err(to_rpc_err)
    }

    async fn get_message_state(&self, id: Uuid) -> RpcResult<MessageState> {
        self.message_service
            .get_message_state(&id)
            .map_err(to_rpc_err)
    }

    async fn get_message_by_cid(&self, cid: Cid) -> RpcResult<Message> {
        self.message_service
            .get_message_by_cid(&cid)
            .map_err(to_rpc_err)
    }

    async fn get_message_by_signed_cid(&self, cid: Cid) -> RpcResult<Message> {
        self.message_service
            .get_message_by_signed_cid(&cid)
            .map_err(to_rpc_err)
    }

    async fn get_message_by_unsigned_cid(&self, cid: Cid) -> RpcResult<Message> {
        self.message_service
            .get_message_by_unsigned_cid(&cid)
            .map_err(to_rpc_err)
    }

    async fn get_message_by_from_and_nonce(
        &self,
        from: Address,
        nonce: u64,
    ) -> RpcResult<Message> {
        self.message_service
            .get_message_by_from_and_nonce(&from, nonce)
            .map_err(to_rpc_err)
    }

    async fn list_message(&self) -> RpcResult<Vec<Message>> {
        self.message_service.list_message().map_err(to_rpc_err)
    }

    async fn list_message_by_address(&self, addr: Address) -> RpcResult<Vec<Message>> {
        self.message_service
            .list_message_by_address(&addr)
            .map_err(to_rpc_err)
    }

    async fn list_message_by_from_state(
        &self,
        from: Address,
        state: MessageState,
        page_index: usize,
        page_size: usize,
    ) -> RpcResult<Vec<Message>> {
        self.message_service
            .list_message_by_from_state(&from, state, page_index, page_size)
            .map_err(to_rpc_err)
    }

    async fn list_failed_message(&self) -> RpcResult<Vec<Message>> {
        self.message_service
            .list_failed_message()
            .map_err(to_rpc_err)
    }

    async fn list_blocked_message(
        &self,
        addr: Address,
        older_than_secs: u64,
    ) -> RpcResult<Vec<Message>> {
        self.message_service
            .list_blocked_message(&addr, Duration::from_secs(older_than_secs))
            .map_err(to_rpc_err)
    }

    async fn wait_message(&self, id: Uuid, confidence: u64) -> RpcResult<Message> {
        self.message_service
            .wait_message(&id, confidence)
            .await
            .map_err(to_rpc_err)
    }

    async fn replace_message(
        &self,
        id: Uuid,
        auto: bool,
        max_fee: TokenAmount,
        gas_limit: i64,
        gas_premium: TokenAmount,
        gas_fee_cap: TokenAmount,
    ) -> RpcResult<Cid> {
        self.message_service
            .replace_message(&id, auto, max_fee, gas_limit, gas_premium, gas_fee_cap)
            .await
            .map_err(to_rpc_err)
    }

    async fn republish_message(&self, id: Uuid) -> RpcResult<()> {
        self.message_service
            .republish_message(&id)
            .await
            .map_err(to_rpc_err)
    }

    async fn mark_bad_message(&self, id: Uuid) -> RpcResult<()> {
        self.message_service
            .mark_bad_message(&id)
            .map_err(to_rpc_err)
    }

    async fn update_message_state_by_id(&self, id: Uuid, state: MessageState) -> RpcResult<()> {
        self.message_service
            .update_message_state_by_id(&id, state)
            .map_err(to_rpc_err)
    }

    async fn update_all_filled_message(&self) -> RpcResult<usize> {
        self.message_service
            .update_all_filled_message()
            .await
            .map_err(to_rpc_err)
    }

    async fn update_filled_message_by_id(&self, id: Uuid) -> RpcResult<Uuid> {
        self.message_service
            .update_filled_message_by_id(&id)
            .await
            .map_err(to_rpc_err)
    }

    async fn save_address(&self, info: AddressInfo) -> RpcResult<Uuid> {
        self.address_service.save_address(&info).map_err(to_rpc_err)
    }

    async fn get_address(&self, addr: Address) -> RpcResult<AddressInfo> {
        self.address_service.get_address(&addr).map_err(to_rpc_err)
    }

    async fn has_address(&self, addr: Address) -> RpcResult<bool> {
        self.address_service.has_address(&addr).map_err(to_rpc_err)
    }

    async fn wallet_has(&self, account: String, addr: Address) -> RpcResult<bool> {
        self.address_service
            .wallet_has(&account, &addr)
            .await
            .map_err(to_rpc_err)
    }

    async fn list_address(&self) -> RpcResult<Vec<AddressInfo>> {
        self.address_service.list_address().map_err(to_rpc_err)
    }

    async fn delete_address(&self, addr: Address) -> RpcResult<()> {
        self.address_service
            .delete_address(&addr)
            .map_err(to_rpc_err)
    }

    async fn forbidden_address(&self, addr: Address) -> RpcResult<()> {
        self.address_service
            .forbidden_address(&addr)
            .map_err(to_rpc_err)
    }

    async fn active_address(&self, addr: Address) -> RpcResult<()> {
        self.address_service
            .active_address(&addr)
            .map_err(to_rpc_err)
    }

    async fn set_select_msg_num(&self, addr: Address, num: u64) -> RpcResult<()> {
        self.address_service
            .set_select_msg_num(&addr, num)
            .map_err(to_rpc_err)
    }

    async fn set_fee_params(
        &self,
        addr: Address,
        gas_over_estimation: f64,
        max_fee: TokenAmount,
        max_fee_cap: TokenAmount,
    ) -> RpcResult<()> {
        self.address_service
            .set_fee_params(&addr, gas_over_estimation, max_fee, max_fee_cap)
            .map_err(to_rpc_err)
    }

    async fn reset_address(&self, addr: Address, target_nonce: u64) -> RpcResult<u64> {
        self.address_service
            .reset_address(&addr, target_nonce)
            .await
            .map_err(to_rpc_err)
    }

    async fn get_shared_params(&self) -> RpcResult<SharedParams> {
        Ok(self.sps.get_params())
    }

    async fn set_shared_params(&self, params: SharedParams) -> RpcResult<()> {
        self.sps.set_params(params).map_err(to_rpc_err)
    }

    async fn save_wallet(&self, wallet: Wallet) -> RpcResult<Uuid> {
        self.wallet_service.save_wallet(&wallet).map_err(to_rpc_err)
    }

    async fn list_wallet(&self) -> RpcResult<Vec<Wallet>> {
        self.wallet_service.list_wallet().map_err(to_rpc_err)
    }

    async fn del_wallet(&self, name: String) -> RpcResult<()> {
        self.wallet_service.del_wallet(&name).map_err(to_rpc_err)
    }

    async fn save_wallet_address(&self, wa: WalletAddress) -> RpcResult<Uuid> {
        self.wallet_service
            .save_wallet_address(&wa)
            .map_err(to_rpc_err)
    }

    async fn list_wallet_address(&self) -> RpcResult<Vec<WalletAddress>> {
        self.wallet_service
            .list_wallet_address()
            .map_err(to_rpc_err)
    }

    async fn update_wallet_address_state(
        &self,
        wallet_name: String,
        addr_id: Uuid,
        state: AddressState,
    ) -> RpcResult<()> {
        self.wallet_service
            .update_wallet_address_state(&wallet_name, &addr_id, state)
            .map_err(to_rpc_err)
    }

    async fn del_wallet_address(&self, wallet_name: String, addr_id: Uuid) -> RpcResult<()> {
        self.wallet_service
            .del_wallet_address(&wallet_name, &addr_id)
            .map_err(to_rpc_err)
    }

    async fn save_node(&self, node: Node) -> RpcResult<()> {
        self.node_service.save_node(&node).await.map_err(to_rpc_err)
    }

    async fn list_node(&self) -> RpcResult<Vec<Node>> {
        self.node_service.list_node().map_err(to_rpc_err)
    }

    async fn delete_node(&self, name: String) -> RpcResult<()> {
        self.node_service.delete_node(&name).map_err(to_rpc_err)
    }
}

/// Start the JSON-RPC server with permission enforcement. The HTTP layer
/// lifts each request's `Authorization` header into the request extensions;
/// the RPC layer checks it against the access map per method call.
pub async fn start_rpc(
    api: MessagerApiImpl,
    listen: SocketAddr,
    secret: Vec<u8>,
) -> anyhow::Result<ServerHandle> {
    let http_middleware = tower::ServiceBuilder::new().layer(AuthHeaderLayer);
    let rpc_middleware = RpcServiceBuilder::new().layer(AuthLayer {
        secret: Arc::new(secret),
    });
    let server = Server::builder()
        .set_http_middleware(http_middleware)
        .set_rpc_middleware(rpc_middleware)
        .build(listen)
        .await?;
    let handle = server.start(api.into_rpc());
    Ok(handle)
}
