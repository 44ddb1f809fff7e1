// Hashcash-style work: find a nonce so the block's hex hash starts with `difficulty` zeros.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::Block;

/// Enough zeros to cover a whole SHA-256 hex digest.
pub const MAX_DIFFICULTY: usize = 64;

/// Are the first `difficulty` characters of `hash` all `'0'`?
pub fn check_work(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|it| it == b'0')
}

/// Increment the candidate's nonce until [check_work] passes.
///
/// `stop` is polled before every attempt, so raising it from another thread
/// returns [DoWorkError::Cancelled] promptly.
pub fn do_work(candidate: &mut Block, difficulty: usize, stop: &AtomicBool) -> Result<(), DoWorkError> {
    let start_nonce = candidate.nonce;
    while !check_work(&candidate.hash, difficulty) {
        if stop.load(Ordering::Relaxed) {
            info!(index = candidate.index, attempts = candidate.nonce - start_nonce, "gave up mining");
            return Err(DoWorkError::Cancelled);
        }
        candidate.nonce += 1;
        candidate.hash = candidate.calculate_hash();
    }
    debug!(
        index = candidate.index,
        nonce = candidate.nonce,
        hash = %candidate.hash,
        "found proof of work"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DoWorkError {
    #[error("mining was cancelled before a proof of work was found")]
    Cancelled,
}
