// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ChainEpoch;

#[derive(Debug, PartialEq, Error)]
pub enum Error {
    #[error("no blocks for tipset")]
    NoBlocks,
    #[error("invalid tipset: {0}")]
    InvalidTipset(String),
}

/// A set of CIDs forming a unique key for a tipset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TipsetKeys {
    pub cids: Vec<Cid>,
}

impl TipsetKeys {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self { cids }
    }

    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }

    /// Whether the key contains exactly the same CIDs, ignoring order.
    pub fn equals(&self, other: &TipsetKeys) -> bool {
        if self.cids.len() != other.cids.len() {
            return false;
        }
        self.cids.iter().all(|c| other.cids.contains(c))
    }
}

/// The parts of a block header the messager tracks: identity, position and
/// parent linkage. Consensus fields stay with the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub cid: Cid,
    pub epoch: ChainEpoch,
    pub parents: TipsetKeys,
}

/// An immutable set of blocks at the same height with the same parent set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tipset {
    blocks: Vec<BlockHeader>,
    key: TipsetKeys,
}

impl Tipset {
    /// Builds a new tipset from a non-empty collection of headers sharing
    /// epoch and parents.
    pub fn new(blocks: Vec<BlockHeader>) -> Result<Self, Error> {
        let first = blocks.first().ok_or(Error::NoBlocks)?;
        for header in &blocks[1..] {
            if header.epoch != first.epoch {
                return Err(Error::InvalidTipset("epochs are not equal".to_string()));
            }
            if !header.parents.equals(&first.parents) {
                return Err(Error::InvalidTipset("parent cids are not equal".to_string()));
            }
        }
        let key = TipsetKeys::new(blocks.iter().map(|b| b.cid).collect());
        Ok(Tipset { blocks, key })
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.blocks[0].epoch
    }

    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    pub fn key(&self) -> &TipsetKeys {
        &self.key
    }

    pub fn cids(&self) -> &[Cid] {
        self.key.cids()
    }

    pub fn parents(&self) -> &TipsetKeys {
        &self.blocks[0].parents
    }
}
