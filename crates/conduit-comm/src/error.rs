use std::sync::Arc;

use thiserror::Error;

/// Failure modes surfaced by a [`crate::buffer::HandoffBuffer`] or
/// [`crate::provider::BufferProvider`].
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer was already closed, or was closed while the caller was
    /// blocked inside `acquire`; in both cases the caller's request was
    /// never satisfied. Callers treat this as normal loop termination
    /// rather than a failure (spec.md §7).
    #[error("handoff buffer is closed")]
    Closed,
    /// `acquire(n)` was asked to claim more slots than the buffer has
    /// capacity for; no amount of waiting would satisfy it.
    #[error("requested {requested} slots but buffer capacity is {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },
}

/// Failure modes surfaced by a [`Codec`](crate) implementation. `InvalidEncoding`
/// corresponds to spec.md §7's read-side "invalid encoding" class (malformed
/// length, bad checksum); `InvalidMessage` to the write-side class (the
/// codec cannot encode an application-supplied buffer). Both are fatal to
/// the connection they occur on, never recoverable mid-frame.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("declared frame length {0} is out of the codec's valid range")]
    InvalidLength(usize),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("message failed codec validation and cannot be encoded")]
    InvalidMessage,
}

/// The unified failure type carried by a channel's close future (spec.md
/// §7: "all user-visible failures flow through the channel's three
/// futures"). `Io` wraps the source in an `Arc` so the same outcome can be
/// cloned out to every waiter on the merged completion future.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("channel is not bound to a local address")]
    NotBound,
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel is closed")]
    Closed,
    #[error("selector was closed before this channel could be registered")]
    RegistrationFailed,
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(Arc::new(err))
    }
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
