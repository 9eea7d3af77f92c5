// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Hot index of recently-active messages. The engine is the only writer;
//! everything is guarded by one mutex and mirrors what the repository holds
//! for the same ids.

use std::collections::HashMap;

use cid::Cid;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{ChainEpoch, Message, MessageState, SAFE_PACK_HEIGHT};

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    by_unsigned_cid: HashMap<Cid, Uuid>,
    by_signed_cid: HashMap<Cid, Uuid>,
    /// Every cid a message has been known under, oldest first.
    id_cids: HashMap<Uuid, Vec<Cid>>,
}

impl Inner {
    fn index(&mut self, msg: &Message) {
        for cid in [msg.unsigned_cid, msg.signed_cid].into_iter().flatten() {
            let history = self.id_cids.entry(msg.id).or_default();
            if !history.contains(&cid) {
                history.push(cid);
            }
        }
        if let Some(cid) = msg.unsigned_cid {
            self.by_unsigned_cid.insert(cid, msg.id);
        }
        if let Some(cid) = msg.signed_cid {
            self.by_signed_cid.insert(cid, msg.id);
        }
    }

    fn unindex(&mut self, msg: &Message) {
        if let Some(cid) = msg.unsigned_cid {
            self.by_unsigned_cid.remove(&cid);
        }
        if let Some(cid) = msg.signed_cid {
            self.by_signed_cid.remove(&cid);
        }
        self.id_cids.remove(&msg.id);
    }
}

#[derive(Default)]
pub struct MessageStateCache {
    inner: Mutex<Inner>,
}

impl MessageStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache, typically with every non-terminal message at startup.
    pub fn load(&self, msgs: Vec<Message>) {
        let mut inner = self.inner.lock();
        for msg in msgs {
            inner.index(&msg);
            inner.messages.insert(msg.id, msg);
        }
    }

    pub fn insert(&self, msg: Message) {
        let mut inner = self.inner.lock();
        inner.index(&msg);
        inner.messages.insert(msg.id, msg);
    }

    pub fn get(&self, id: &Uuid) -> Option<Message> {
        self.inner.lock().messages.get(id).cloned()
    }

    pub fn get_by_unsigned_cid(&self, cid: &Cid) -> Option<Message> {
        let inner = self.inner.lock();
        let id = inner.by_unsigned_cid.get(cid)?;
        inner.messages.get(id).cloned()
    }

    pub fn get_by_signed_cid(&self, cid: &Cid) -> Option<Message> {
        let inner = self.inner.lock();
        let id = inner.by_signed_cid.get(cid)?;
        inner.messages.get(id).cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.lock().messages.contains_key(id)
    }

    /// Mutate a cached message in place, refreshing the cid indexes.
    /// Returns false when the id is not cached.
    pub fn update<F: FnOnce(&mut Message)>(&self, id: &Uuid, f: F) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut msg) = inner.messages.remove(id) else {
            return false;
        };
        f(&mut msg);
        inner.index(&msg);
        inner.messages.insert(msg.id, msg);
        true
    }

    pub fn remove(&self, id: &Uuid) {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner.messages.remove(id) {
            inner.unindex(&msg);
        }
    }

    /// Drop messages that are confirmed deeply enough to be stable.
    pub fn evict_confirmed(&self, head_height: ChainEpoch) {
        let mut inner = self.inner.lock();
        let stable: Vec<Uuid> = inner
            .messages
            .values()
            .filter(|m| {
                m.state == MessageState::OnChain && head_height - m.height >= SAFE_PACK_HEIGHT
            })
            .map(|m| m.id)
            .collect();
        for id in stable {
            if let Some(msg) = inner.messages.remove(&id) {
                inner.unindex(&msg);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }
}
