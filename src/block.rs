use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::sync::atomic::AtomicBool;
use tap::Tap as _;

use crate::proof_of_work::{do_work, DoWorkError};

/// One entry in the ledger: a fingerprint of a stored document, linked to its predecessor.
///
/// Fields are only mutated while the block is a mining candidate.
/// Once a block is appended to a [Ledger](crate::Ledger) nothing hands out a mutable reference to it.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub(crate) index: u64,
    pub(crate) timestamp: String,
    pub(crate) document_hash: String,
    pub(crate) document_ref: String,
    pub(crate) previous_hash: String,
    pub(crate) hash: String,
    pub(crate) nonce: u64,
}

impl Block {
    /// Build an unmined block with `nonce = 0` and its hash already filled in.
    pub fn new(
        index: u64,
        timestamp: impl Into<String>,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
        previous_hash: impl Into<String>,
    ) -> Self {
        Self {
            index,
            timestamp: timestamp.into(),
            document_hash: document_hash.into(),
            document_ref: document_ref.into(),
            previous_hash: previous_hash.into(),
            hash: String::new(),
            nonce: 0,
        }
        .tap_mut(|it| it.hash = it.calculate_hash())
    }

    /// SHA-256 over `index ++ previous_hash ++ timestamp ++ document_hash ++ nonce`,
    /// integers in decimal, no delimiters. Lowercase hex.
    ///
    /// The stored `hash` and `document_ref` are not inputs.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_string());
        hasher.update(&self.previous_hash);
        hasher.update(&self.timestamp);
        hasher.update(&self.document_hash);
        hasher.update(self.nonce.to_string());
        hex::encode(hasher.finalize())
    }

    /// Bump the nonce until the hash has `difficulty` leading zero hex digits.
    ///
    /// Expect around `16^difficulty` attempts. There is no upper bound, see [Block::mine_until].
    pub fn mine(&mut self, difficulty: usize) {
        match self.mine_until(difficulty, &AtomicBool::new(false)) {
            Ok(()) => (),
            Err(DoWorkError::Cancelled) => unreachable!("nobody else holds the stop flag"),
        }
    }

    /// Like [Block::mine], but gives up once `stop` is raised.
    /// On cancellation the block is left part-way through the search and must not be published.
    pub fn mine_until(&mut self, difficulty: usize, stop: &AtomicBool) -> Result<(), DoWorkError> {
        do_work(self, difficulty, stop)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn document_hash(&self) -> &str {
        &self.document_hash
    }

    /// Where the document lives. Empty for genesis.
    pub fn document_ref(&self) -> &str {
        &self.document_ref
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Does the stored hash match a fresh recomputation?
    pub fn is_self_consistent(&self) -> bool {
        self.hash == self.calculate_hash()
    }
}
