// A shareable handle to a single Ledger.
//
// Appends are serialized behind one lock that is held across mining, so the
// tip can't move under a candidate. The ledger itself is only write-locked
// for the instant it takes to push a finished block, which means readers
// never wait on the proof-of-work search and never see a half-mined block.
// Waiting for the append lock honours the same stop flag as mining.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, TryLockError,
    },
    thread,
    time::Duration,
};

use tracing::info;

use crate::{
    document::{hash_document, HashDocumentError},
    ledger::{now, AddDocumentError, LedgerError},
    proof_of_work::{do_work, DoWorkError},
    Block, Ledger,
};

const APPEND_LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Default)]
pub struct Vault {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ledger: RwLock<Ledger>,
    appending: Mutex<()>,
}

impl From<Ledger> for Vault {
    fn from(ledger: Ledger) -> Self {
        Self::new(ledger)
    }
}

impl Vault {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger: RwLock::new(ledger),
                appending: Mutex::new(()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.inner.ledger.read().expect("a writer panicked while appending")
    }

    /// A copy of the chain as of now.
    pub fn snapshot(&self) -> Ledger {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.read().is_valid()
    }

    pub fn find_by_document_hash(&self, document_hash: &str) -> Option<String> {
        self.read()
            .find_by_document_hash(document_hash)
            .map(str::to_owned)
    }

    pub fn add_document(
        &self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
    ) -> Result<Block, LedgerError> {
        match self.add_document_until(document_hash, document_ref, &AtomicBool::new(false)) {
            Ok(block) => Ok(block),
            Err(AddDocumentError::Ledger(error)) => Err(error),
            Err(AddDocumentError::Cancelled(_)) => unreachable!("nobody else holds the stop flag"),
        }
    }

    /// Mine and append, giving up once `stop` is raised.
    pub fn add_document_until(
        &self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
        stop: &AtomicBool,
    ) -> Result<Block, AddDocumentError> {
        let _appending = self.lock_appending(stop)?;
        let (mut candidate, difficulty) = {
            let ledger = self.read();
            (
                ledger.candidate(document_hash, document_ref, now())?,
                ledger.difficulty(),
            )
        };
        do_work(&mut candidate, difficulty, stop)?;
        if stop.load(Ordering::Relaxed) {
            return Err(DoWorkError::Cancelled.into());
        }
        let mut ledger = self
            .inner
            .ledger
            .write()
            .expect("a writer panicked while appending");
        Ok(ledger.append(candidate).clone())
    }

    /// Wait for any other append to finish, or for `stop` to be raised.
    fn lock_appending(&self, stop: &AtomicBool) -> Result<MutexGuard<'_, ()>, DoWorkError> {
        loop {
            match self.inner.appending.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => panic!("another append panicked"),
                Err(TryLockError::WouldBlock) => {
                    if stop.load(Ordering::Relaxed) {
                        return Err(DoWorkError::Cancelled);
                    }
                    thread::sleep(APPEND_LOCK_POLL);
                }
            }
        }
    }

    /// Hash the file, then mine a block for it. The file path is recorded as the locator.
    ///
    /// The file is read in full before mining starts; if it can't be read, nothing is appended.
    pub fn add_file(&self, path: impl AsRef<Path>, stop: &AtomicBool) -> Result<Block, AddFileError> {
        let path = path.as_ref();
        let document_hash = hash_document(path)?;
        Ok(self.add_document_until(document_hash, path.display().to_string(), stop)?)
    }

    /// Mine on a worker thread so the caller can bound how long it waits.
    pub fn spawn_add_document(
        &self,
        document_hash: impl Into<String>,
        document_ref: impl Into<String>,
    ) -> MiningTask {
        let (document_hash, document_ref) = (document_hash.into(), document_ref.into());
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn({
            let vault = self.clone();
            let stop = Arc::clone(&stop);
            move || {
                let result = vault.add_document_until(document_hash, document_ref, &stop);
                // the task may have been dropped, in which case nobody wants the result
                let _ = sender.send(result);
            }
        });
        MiningTask {
            stop,
            receiver,
            handle,
        }
    }
}

/// A block being mined on a worker thread.
///
/// Dropping the task detaches it: the worker keeps mining and will still append.
/// Call [MiningTask::cancel] first to prevent that.
#[derive(Debug)]
pub struct MiningTask {
    stop: Arc<AtomicBool>,
    receiver: mpsc::Receiver<Result<Block, AddDocumentError>>,
    handle: thread::JoinHandle<()>,
}

impl MiningTask {
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker, however long mining takes.
    pub fn join(self) -> Result<Block, MiningTaskError> {
        let result = self.receiver.recv();
        self.finish(result.map_err(|_| MiningTaskError::WorkerPanicked))
    }

    /// Wait up to `timeout`, cancelling the search if it runs over.
    ///
    /// A block that was found just as the timeout fired is still returned, since it has already been appended.
    pub fn join_timeout(self, timeout: Duration) -> Result<Block, MiningTaskError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => self.finish(Ok(result)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.finish(Err(MiningTaskError::WorkerPanicked))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                info!(?timeout, "mining ran over, cancelling");
                self.cancel();
                let result = self.receiver.recv();
                match self.finish(result.map_err(|_| MiningTaskError::WorkerPanicked)) {
                    Err(MiningTaskError::Cancelled) => Err(MiningTaskError::TimedOut(timeout)),
                    other => other,
                }
            }
        }
    }

    fn finish(
        self,
        received: Result<Result<Block, AddDocumentError>, MiningTaskError>,
    ) -> Result<Block, MiningTaskError> {
        let joined = self.handle.join();
        match (received, joined) {
            (_, Err(_)) | (Err(MiningTaskError::WorkerPanicked), _) => {
                Err(MiningTaskError::WorkerPanicked)
            }
            (Err(other), _) => Err(other),
            (Ok(Ok(block)), _) => Ok(block),
            (Ok(Err(AddDocumentError::Cancelled(_))), _) => Err(MiningTaskError::Cancelled),
            (Ok(Err(AddDocumentError::Ledger(error))), _) => Err(MiningTaskError::Ledger(error)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddFileError {
    #[error(transparent)]
    Hash(#[from] HashDocumentError),
    #[error(transparent)]
    Add(#[from] AddDocumentError),
}

/// How a [MiningTask] ended without a block.
#[derive(Debug, thiserror::Error)]
pub enum MiningTaskError {
    #[error("mining was cancelled")]
    Cancelled,
    #[error("mining took longer than {0:?}")]
    TimedOut(Duration),
    #[error("mining worker panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Ledger(LedgerError),
}
