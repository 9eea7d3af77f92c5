// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chrono::{DateTime, Utc};
use cid::Cid;
use fvm_ipld_encoding::{RawBytes, DAG_CBOR};
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::econ::TokenAmount;
use super::{Address, ChainEpoch, MethodNum};

/// Compute the content id of a DAG-CBOR encoded value.
pub fn cid_from_cbor<T: Serialize>(value: &T) -> Result<Cid, fvm_ipld_encoding::Error> {
    let data = fvm_ipld_encoding::to_vec(value)?;
    Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&data)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureType {
    Secp256k1,
    Bls,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub sig_type: SignatureType,
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn new_secp256k1(bytes: Vec<u8>) -> Self {
        Signature {
            sig_type: SignatureType::Secp256k1,
            bytes,
        }
    }

    pub fn new_bls(bytes: Vec<u8>) -> Self {
        Signature {
            sig_type: SignatureType::Bls,
            bytes,
        }
    }
}

/// Transaction content as submitted by a caller. Gas fields are left zeroed
/// until estimation fills them in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsignedMessage {
    pub version: u64,
    pub to: Address,
    pub from: Address,
    pub sequence: u64,
    pub value: TokenAmount,
    pub gas_limit: i64,
    pub gas_fee_cap: TokenAmount,
    pub gas_premium: TokenAmount,
    pub method_num: MethodNum,
    pub params: RawBytes,
}

impl UnsignedMessage {
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        cid_from_cbor(self)
    }

    pub fn marshal_cbor(&self) -> Result<Vec<u8>, fvm_ipld_encoding::Error> {
        fvm_ipld_encoding::to_vec(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: UnsignedMessage,
    pub signature: Signature,
}

impl SignedMessage {
    pub fn new(message: UnsignedMessage, signature: Signature) -> Self {
        SignedMessage { message, signature }
    }

    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        cid_from_cbor(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub exit_code: i64,
    pub return_data: RawBytes,
    pub gas_used: i64,
}

impl MessageReceipt {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-message policy overrides. Zero/unset fields inherit the shared
/// parameters at selection time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgMeta {
    pub expire_epoch: ChainEpoch,
    pub gas_over_estimation: f64,
    pub max_fee: TokenAmount,
    pub max_fee_cap: TokenAmount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Stored, not yet signed. Nonce and gas are unassigned.
    Unfilled,
    /// Signed with a frozen nonce, waiting to land on chain.
    Filled,
    /// Included in a tipset; receipt and height recorded.
    OnChain,
    /// Expire epoch passed while still unfilled.
    Expired,
    /// Terminally failed (estimation strike-out or operator action).
    Failed,
    /// Superseded by a user-initiated replacement at the same nonce.
    Replaced,
}

impl MessageState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Expired | MessageState::Failed | MessageState::Replaced
        )
    }
}

/// A tracked message through its whole lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message: UnsignedMessage,
    pub signature: Option<Signature>,
    pub unsigned_cid: Option<Cid>,
    pub signed_cid: Option<Cid>,
    /// Height of the tipset whose receipts include this message; zero until
    /// the message is on chain.
    pub height: ChainEpoch,
    pub receipt: Option<MessageReceipt>,
    pub meta: MsgMeta,
    pub wallet_name: String,
    pub state: MessageState,
    /// Latest estimation or signing error, for operator inspection.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(message: UnsignedMessage, meta: MsgMeta, wallet_name: String) -> Self {
        Self::with_id(Uuid::new_v4(), message, meta, wallet_name)
    }

    pub fn with_id(id: Uuid, message: UnsignedMessage, meta: MsgMeta, wallet_name: String) -> Self {
        let now = Utc::now();
        Message {
            id,
            message,
            signature: None,
            unsigned_cid: None,
            signed_cid: None,
            height: 0,
            receipt: None,
            meta,
            wallet_name,
            state: MessageState::Unfilled,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The signed envelope, if a signature has been attached.
    pub fn signed_message(&self) -> Option<SignedMessage> {
        self.signature.as_ref().map(|sig| SignedMessage {
            message: self.message.clone(),
            signature: sig.clone(),
        })
    }

    /// Recompute the signed cid from the stored signature.
    pub fn compute_signed_cid(&self) -> Option<Cid> {
        self.signed_message().and_then(|smsg| smsg.cid().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sequence: u64) -> UnsignedMessage {
        UnsignedMessage {
            to: Address::new("f0100").unwrap(),
            from: Address::new("f0101").unwrap(),
            sequence,
            value: TokenAmount::from_atto(1),
            ..Default::default()
        }
    }

    #[test]
    fn cid_is_a_function_of_content() {
        let a = msg(0);
        let b = msg(0);
        assert_eq!(a.cid().unwrap(), b.cid().unwrap());
        assert_ne!(a.cid().unwrap(), msg(1).cid().unwrap());
    }

    #[test]
    fn signed_cid_differs_from_unsigned() {
        let unsigned = msg(7);
        let smsg = SignedMessage::new(unsigned.clone(), Signature::new_secp256k1(vec![1, 2, 3]));
        assert_ne!(unsigned.cid().unwrap(), smsg.cid().unwrap());

        // same signature bytes, same cid
        let again = SignedMessage::new(unsigned, Signature::new_secp256k1(vec![1, 2, 3]));
        assert_eq!(smsg.cid().unwrap(), again.cid().unwrap());
    }

    #[test]
    fn terminal_states() {
        assert!(!MessageState::Unfilled.is_terminal());
        assert!(!MessageState::OnChain.is_terminal());
        assert!(MessageState::Failed.is_terminal());
        assert!(MessageState::Expired.is_terminal());
        assert!(MessageState::Replaced.is_terminal());
    }
}
