// portsplice/src/error.rs
//
// Library error type. Admin calls return these synchronously; data-path
// failures are handled in-engine (teardown) and never surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("host bucket `{0}` already exists")]
    BucketExists(String),

    #[error("host bucket `{0}` not found")]
    BucketNotFound(String),

    #[error("rule not found")]
    RuleNotFound,

    #[error("no usable endpoint")]
    NoEndpoint,

    #[error("endpoint count {0} out of range (1..={max})", max = crate::types::MAX_ENDPOINTS)]
    BadEndpointCount(usize),

    #[error("host name exceeds {max} bytes", max = crate::types::MAX_HOST_LEN)]
    HostTooLong,

    #[error("tls origination is not supported in broadcast mode")]
    BroadcastTls,

    #[error("tls configuration: {0}")]
    Tls(String),

    #[error("tls handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
