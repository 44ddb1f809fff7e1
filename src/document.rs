// Content fingerprints for stored documents.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use sha2::{Digest as _, Sha256};

/// SHA-256 of the file's contents as lowercase hex, streamed rather than read into memory.
pub fn hash_document(path: impl AsRef<Path>) -> Result<String, HashDocumentError> {
    let path = path.as_ref();
    let error = |source: io::Error| match source.kind() {
        io::ErrorKind::NotFound => HashDocumentError::NotFound {
            path: path.to_owned(),
        },
        _ => HashDocumentError::Io {
            path: path.to_owned(),
            source,
        },
    };
    let mut file = File::open(path).map_err(error)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(error)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(content: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(content))
}

#[derive(Debug, thiserror::Error)]
pub enum HashDocumentError {
    #[error("no document at {}", path.display())]
    NotFound { path: PathBuf },
    #[error("couldn't read document {}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
}
