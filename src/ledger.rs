use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    proof_of_work::{check_work, DoWorkError, MAX_DIFFICULTY},
    Block,
};

pub const DEFAULT_DIFFICULTY: usize = 4;
pub const GENESIS_TIMESTAMP: &str = "01/01/2024";
pub const GENESIS_DOCUMENT_HASH: &str = "Genesis Block";

/// An append-only chain of document fingerprints, each gated by proof of work.
///
/// This is the "functional core": it owns the chain exclusively and never
/// reorders, removes or edits a block once it has been appended.
/// Share it between threads through a [Vault](crate::Vault).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LedgerRecord")]
pub struct Ledger {
    difficulty: usize,
    chain: Vec<Block>,
}

/// The on-disk shape of a [Ledger], before its shape is checked.
#[derive(Deserialize)]
struct LedgerRecord {
    difficulty: usize,
    chain: Vec<Block>,
}

impl TryFrom<LedgerRecord> for Ledger {
    type Error = LedgerError;

    fn try_from(LedgerRecord { difficulty, chain }: LedgerRecord) -> Result<Self, Self::Error> {
        check_difficulty(difficulty)?;
        match chain.is_empty() {
            true => Err(LedgerError::EmptyChain),
            false => Ok(Self { difficulty, chain }),
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            chain: vec![Self::genesis()],
        }
    }
}

fn check_difficulty(difficulty: usize) -> Result<(), LedgerError> {
    match difficulty <= MAX_DIFFICULTY {
        true => Ok(()),
        false => Err(LedgerError::InvalidDifficulty(difficulty)),
    }
}

impl Ledger {
    /// A ledger holding only the genesis block.
    pub fn new(difficulty: usize) -> Result<Self, LedgerError> {
        check_difficulty(difficulty)?;
        Ok(Self {
            difficulty,
            chain: vec![Self::genesis()],
        })
    }

    /// The fixed first block. Identical for every ledger, and never mined.
    pub fn genesis() -> Block {
        Block::new(0, GENESIS_TIMESTAMP, GENESIS_DOCUMENT_HASH, "", "0")
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.chain.get(index)
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Always false for a ledger built through this API: genesis is never removed.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The current tip.
    ///
    /// Fails with [LedgerError::EmptyChain] only if the genesis invariant has been broken.
    pub fn latest(&self) -> Result<&Block, LedgerError> {
        self.chain.last().ok_or(LedgerError::EmptyChain)
    }

    /// Fingerprint a document: mine a block for it on top of the tip, then append it.
    pub fn add_document(
        &mut self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
    ) -> Result<&Block, LedgerError> {
        self.add_document_at(document_hash, document_ref, now())
    }

    /// [Ledger::add_document] with a caller-chosen timestamp.
    pub fn add_document_at(
        &mut self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Result<&Block, LedgerError> {
        let mut candidate = self.candidate(document_hash, document_ref, timestamp)?;
        candidate.mine(self.difficulty);
        Ok(self.append(candidate))
    }

    /// [Ledger::add_document], abandoning the search once `stop` is raised.
    /// A cancelled append leaves the chain untouched.
    pub fn add_document_until(
        &mut self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
        stop: &AtomicBool,
    ) -> Result<&Block, AddDocumentError> {
        let mut candidate = self.candidate(document_hash, document_ref, now())?;
        candidate.mine_until(self.difficulty, stop)?;
        Ok(self.append(candidate))
    }

    /// An unmined block linked to the current tip.
    pub(crate) fn candidate(
        &self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Result<Block, LedgerError> {
        let tip = self.latest()?;
        Ok(Block::new(
            self.chain.len() as u64,
            timestamp,
            document_hash,
            document_ref,
            tip.hash.clone(),
        ))
    }

    /// Publish a mined candidate. The caller must not have appended anything since [Ledger::candidate].
    pub(crate) fn append(&mut self, mined: Block) -> &Block {
        debug_assert_eq!(mined.index as usize, self.chain.len());
        debug_assert_eq!(
            Some(mined.previous_hash.as_str()),
            self.chain.last().map(|it| it.hash.as_str())
        );
        info!(
            index = mined.index,
            nonce = mined.nonce,
            hash = %mined.hash,
            document_ref = %mined.document_ref,
            "appended block"
        );
        self.chain.push(mined);
        &self.chain[self.chain.len() - 1]
    }

    /// The locator of the first block fingerprinting `document_hash`.
    pub fn find_by_document_hash(&self, document_hash: &str) -> Option<&str> {
        self.find_block_by_document_hash(document_hash)
            .map(Block::document_ref)
    }

    /// First match wins: the same document may be fingerprinted more than once.
    pub fn find_block_by_document_hash(&self, document_hash: &str) -> Option<&Block> {
        self.chain
            .iter()
            .find(|it| it.document_hash == document_hash)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Replay every hash in the chain, reporting the first thing that doesn't add up.
    ///
    /// Beyond self-consistency and linkage, this also re-checks each block's
    /// proof of work against the ledger's difficulty, pins the genesis block,
    /// and checks that indices count up from zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let result = self.validate_inner();
        if let Err(error) = &result {
            warn!(%error, "ledger failed validation");
        }
        result
    }

    fn validate_inner(&self) -> Result<(), ValidationError> {
        match self.chain.first() {
            Some(first) if *first == Self::genesis() => (),
            _ => return Err(ValidationError::GenesisMismatch),
        }
        for (position, (previous, current)) in self.chain.iter().tuple_windows().enumerate() {
            let index = position + 1;
            if current.index != index as u64 {
                return Err(ValidationError::IndexOutOfSequence(index));
            }
            if !current.is_self_consistent() {
                return Err(ValidationError::HashMismatch(index));
            }
            if current.previous_hash != previous.hash {
                return Err(ValidationError::BrokenLink(index));
            }
            if !check_work(&current.hash, self.difficulty) {
                return Err(ValidationError::InsufficientWork(index));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rebuild a ledger from [Ledger::to_json] output.
    ///
    /// Only the shape is checked here; call [Ledger::is_valid] before trusting the contents.
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|source| LedgerError::Io {
            path: path.to_owned(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| LedgerError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&json)
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("the chain has no genesis block")]
    EmptyChain,
    #[error("difficulty {0} is more than the 64 hex digits in a hash")]
    InvalidDifficulty(usize),
    #[error("couldn't (de)serialize the ledger")]
    Json(#[from] serde_json::Error),
    #[error("couldn't access ledger file {}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AddDocumentError {
    #[error(transparent)]
    Cancelled(#[from] DoWorkError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a chain is not valid. Tampering is reported, never panicked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, enum_as_inner::EnumAsInner)]
pub enum ValidationError {
    #[error("the first block is not the genesis block")]
    GenesisMismatch,
    #[error("block at position {0} carries the wrong index")]
    IndexOutOfSequence(usize),
    #[error("block {0} does not hash to its stored hash")]
    HashMismatch(usize),
    #[error("block {0} does not point at its predecessor's hash")]
    BrokenLink(usize),
    #[error("block {0} does not meet the ledger's difficulty")]
    InsufficientWork(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(documents: &[(&str, &str)]) -> Ledger {
        let mut ledger = Ledger::new(2).unwrap();
        for (position, (hash, path)) in documents.iter().enumerate() {
            ledger
                .add_document_at(*hash, *path, format!("2024-01-0{}T00:00:00Z", position + 2))
                .unwrap();
        }
        ledger
    }

    #[test]
    fn genesis_is_fixed() {
        let genesis = Ledger::genesis();
        assert_eq!(genesis.index(), 0);
        assert_eq!(genesis.previous_hash(), "0");
        assert_eq!(genesis.document_hash(), "Genesis Block");
        assert_eq!(genesis.document_ref(), "");
        assert_eq!(genesis.nonce(), 0);
        assert_eq!(genesis, Ledger::default().blocks()[0]);
        assert_eq!(Ledger::genesis(), Ledger::new(3).unwrap().blocks()[0]);
    }

    #[test]
    fn fresh_ledger_is_valid() {
        let ledger = Ledger::default();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.difficulty(), DEFAULT_DIFFICULTY);
        assert!(ledger.is_valid());
        assert_eq!(ledger.latest().unwrap(), &Ledger::genesis());
    }

    #[test]
    fn difficulty_beyond_hash_width_is_rejected() {
        assert!(matches!(
            Ledger::new(65),
            Err(LedgerError::InvalidDifficulty(65))
        ));
        assert!(Ledger::new(64).is_ok());
    }

    #[test]
    fn add_document_scenario() {
        let mut ledger = Ledger::new(2).unwrap();
        let genesis_hash = ledger.latest().unwrap().hash().to_owned();
        let block = ledger.add_document("abc123", "/docs/a.txt").unwrap().clone();
        assert_eq!(block.index(), 1);
        assert_eq!(block.previous_hash(), genesis_hash);
        assert!(block.hash().starts_with("00"));
        assert_eq!(ledger.find_by_document_hash("abc123"), Some("/docs/a.txt"));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.is_valid());
    }

    #[test]
    fn appends_are_monotonic_and_linked() {
        let ledger = ledger_with(&[("a", "/a"), ("b", "/b"), ("c", "/c"), ("d", "/d")]);
        assert_eq!(ledger.len(), 5);
        for (position, block) in ledger.blocks().iter().enumerate() {
            assert_eq!(block.index(), position as u64);
        }
        for (previous, current) in ledger.blocks().iter().tuple_windows() {
            assert_eq!(current.previous_hash(), previous.hash());
            assert!(current.hash().starts_with("00"));
        }
        assert!(ledger.is_valid());
    }

    #[test]
    fn lookup_misses_and_first_match_wins() {
        let ledger = ledger_with(&[("same", "/first"), ("other", "/other"), ("same", "/second")]);
        assert_eq!(ledger.find_by_document_hash("same"), Some("/first"));
        assert_eq!(ledger.find_by_document_hash("missing"), None);
        assert_eq!(
            ledger.find_block_by_document_hash("other").map(Block::index),
            Some(2)
        );
    }

    #[test]
    fn corrupted_document_hash_is_detected() {
        let mut ledger = ledger_with(&[("first", "/1"), ("second", "/2")]);
        assert!(ledger.is_valid());
        ledger.chain[1].document_hash.replace_range(0..1, "F");
        assert!(!ledger.is_valid());
        assert_eq!(ledger.len(), 3);
        assert_eq!(
            ledger.validate().unwrap_err().as_hash_mismatch(),
            Some(&1)
        );
    }

    #[test]
    fn any_field_edit_is_detected() {
        let pristine = ledger_with(&[("first", "/1"), ("second", "/2")]);
        let edits: [fn(&mut Block); 5] = [
            |it| it.index += 1,
            |it| it.timestamp.push('!'),
            |it| it.previous_hash.push('!'),
            |it| it.nonce += 1,
            |it| it.hash.replace_range(0..2, "ff"),
        ];
        for edit in edits {
            for target in 1..pristine.len() {
                let mut tampered = pristine.clone();
                edit(&mut tampered.chain[target]);
                assert!(!tampered.is_valid(), "edit to block {target} went unnoticed");
            }
        }
    }

    #[test]
    fn remined_block_still_breaks_the_next_link() {
        let mut ledger = ledger_with(&[("first", "/1"), ("second", "/2")]);
        let tampered = &mut ledger.chain[1];
        tampered.document_hash = "forged".into();
        tampered.mine(2);
        assert_eq!(
            ledger.validate(),
            Err(ValidationError::BrokenLink(2))
        );
    }

    #[test]
    fn unmined_block_fails_work_check() {
        let mut ledger = Ledger::new(2).unwrap();
        let mut lazy = ledger.candidate("doc", "/doc", "t").unwrap();
        // nonce 0 could pass by luck, so search for one that doesn't
        while check_work(&lazy.hash, 2) {
            lazy.nonce += 1;
            lazy.hash = lazy.calculate_hash();
        }
        ledger.chain.push(lazy);
        assert_eq!(
            ledger.validate(),
            Err(ValidationError::InsufficientWork(1))
        );
    }

    #[test]
    fn swapped_genesis_is_detected() {
        let mut ledger = ledger_with(&[("first", "/1")]);
        ledger.chain[0] = Block::new(0, "02/02/2024", GENESIS_DOCUMENT_HASH, "", "0");
        assert_eq!(ledger.validate(), Err(ValidationError::GenesisMismatch));
    }

    #[test]
    fn empty_chain_has_no_tip() {
        let ledger = Ledger {
            difficulty: 1,
            chain: vec![],
        };
        assert!(matches!(ledger.latest(), Err(LedgerError::EmptyChain)));
        assert!(!ledger.is_valid());
    }

    #[test]
    fn cancelled_append_leaves_chain_untouched() {
        let mut ledger = Ledger::new(MAX_DIFFICULTY).unwrap();
        let result = ledger.add_document_until("doc", "/doc", &AtomicBool::new(true));
        assert!(matches!(result, Err(AddDocumentError::Cancelled(_))));
        assert_eq!(ledger, Ledger::new(MAX_DIFFICULTY).unwrap());
    }

    #[test]
    fn json_round_trip_stays_valid() {
        let ledger = ledger_with(&[("first", "/1"), ("second", "/2")]);
        let restored = Ledger::from_json(&ledger.to_json().unwrap()).unwrap();
        assert_eq!(restored, ledger);
        assert!(restored.is_valid());
    }

    #[test]
    fn loading_rejects_malformed_ledgers() {
        assert!(matches!(
            Ledger::from_json(r#"{"difficulty": 2, "chain": []}"#),
            Err(LedgerError::Json(_))
        ));
        assert!(Ledger::from_json(r#"{"difficulty": 99, "chain": []}"#).is_err());
        assert!(Ledger::from_json("not json").is_err());
    }

    #[test]
    fn tampered_file_loads_but_is_invalid() {
        let ledger = ledger_with(&[("first", "/1")]);
        let json = ledger.to_json().unwrap().replace("first", "FIRST");
        let restored = Ledger::from_json(&json).unwrap();
        assert!(!restored.is_valid());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        let ledger = ledger_with(&[("first", "/1")]);
        ledger.save(&path).unwrap();
        assert_eq!(Ledger::load(&path).unwrap(), ledger);
        assert!(matches!(
            Ledger::load(dir.path().join("missing.json")),
            Err(LedgerError::Io { .. })
        ));
    }
}
