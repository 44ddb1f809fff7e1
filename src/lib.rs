// A tamper-evident log of document fingerprints.
//
// Each stored document's SHA-256 is sealed into a block that links to the
// previous block's hash, and every block after genesis has to pay a small
// proof of work before it is appended.

mod block;
mod document;
mod ledger;
mod proof_of_work;
mod vault;

pub use block::Block;
pub use document::{hash_bytes, hash_document, HashDocumentError};
pub use ledger::{
    AddDocumentError, Ledger, LedgerError, ValidationError, DEFAULT_DIFFICULTY,
    GENESIS_DOCUMENT_HASH, GENESIS_TIMESTAMP,
};
pub use proof_of_work::{check_work, do_work, DoWorkError, MAX_DIFFICULTY};
pub use vault::{AddFileError, MiningTask, MiningTaskError, Vault};
