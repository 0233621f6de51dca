/// Error surface for every dispatch-reachable operation.
///
/// One variant per error kind in the control-plane contract; callers match
/// on these the same way `librqbit::Error` consumers match on e.g.
/// `Error::PeerDisconnected` rather than string-sniffing an `anyhow::Error`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("already shut down")]
    AlreadyShutDown,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("name already exists")]
    NameExists,
    #[error("remote peer changed")]
    RemoteChanged,
    #[error("not found")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation would block")]
    WouldBlock,
    #[error("out of memory")]
    OutOfMemory,
    #[error("message too big")]
    MsgTooBig,
    #[error("bad address")]
    Fault,
    #[error("interrupted")]
    Interrupted,
    #[error("internal invariant violated")]
    Bug,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Logs an invariant violation at `error!` before surfacing it as
/// `Error::Bug`, matching spec's "asserted and logged; must never silently
/// corrupt state" handling of things like a double cleanup or a null `info`
/// on an `ACTIVE` peer. A bug here is a contract violation somewhere in this
/// crate, not a caller mistake, so it always gets logged regardless of the
/// caller's own tracing configuration.
macro_rules! bug {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        return Err($crate::error::Error::Bug);
    }};
}

pub(crate) use bug;
