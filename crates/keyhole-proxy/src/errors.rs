use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("certificate authority error: {0}")]
    Ca(#[from] keyhole_ca::CaError),
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}
