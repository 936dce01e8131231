//! Error taxonomy shared by the Collector and Shipper binaries (spec §7).

use thiserror::Error;

/// Top-level error kind. Only `Config` at startup and `Lock` loss are fatal to the
/// owning process; everything else is recorded and the request/attempt fails alone.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode: {0}")]
    Encode(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("lock: {0}")]
    Lock(String),

    #[error("disk pressure: used {used_pct:.1}% (threshold {threshold_pct:.0}%)")]
    DiskPressure { used_pct: f64, threshold_pct: f64 },
}

pub type Result<T> = std::result::Result<T, AgentError>;
