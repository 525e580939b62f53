use thiserror::Error;

use crate::mount::registry::ListenerKey;

/// Errors surfaced synchronously by `forward_local` / `forward_remote`.
///
/// Per-connection dial failures and acceptor failures are not represented
/// here: they stay local to the affected connection or accept loop and are
/// only logged.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("mount: duplicate listener ({0})")]
    DuplicateListener(ListenerKey),
    #[error("mount: bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mount: register protocol handler: {0}")]
    Handler(anyhow::Error),
}

/// Errors of the administrative surface.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin: cannot forward overlay streams to another overlay protocol")]
    ProtocolChain,
    #[error("admin: only \"peer\" is allowed as an overlay listen address (got {0:?})")]
    BadListenAddress(String),
    #[error("admin: invalid target peer address {0:?}")]
    BadTargetAddress(String),
    #[error("admin: empty protocol tag")]
    EmptyProtocol,
    #[error("admin: stream {0} not found")]
    StreamNotFound(u64),
    #[error("admin: no match criteria given (pass all to close everything)")]
    EmptyMatch,
    #[error(transparent)]
    Forward(#[from] ForwardError),
}
