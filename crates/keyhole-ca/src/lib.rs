use std::sync::{Arc, OnceLock};

use rustls::KeyLogFile;
use thiserror::Error;

mod authority;
mod loader;

pub use authority::{CertificateAuthority, IssuedLeaf, LeafCacheStatus};
pub use loader::{CaLoader, DirLoader, MemLoader, RootMaterialPem};

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate authority lock poisoned")]
    LockPoisoned,
}

/// Process-wide NSS key log honoring `SSLKEYLOGFILE`, opened once and shared
/// by every TLS config this proxy builds. rustls serializes writes internally.
pub fn process_key_log() -> Arc<KeyLogFile> {
    static KEY_LOG: OnceLock<Arc<KeyLogFile>> = OnceLock::new();
    Arc::clone(KEY_LOG.get_or_init(|| Arc::new(KeyLogFile::new())))
}
