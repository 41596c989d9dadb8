//! `conduit-net`: a reactor-style framed message I/O substrate (spec.md §1-2).
//!
//! A [`reactor::SelectorPool`] runs a fixed number of reactors, each with its
//! own ACCEPT/READ/WRITE selector thread triplet (spec.md §3/§4.3). A
//! [`acceptor::TcpAcceptor`]/[`acceptor::TlsAcceptor`] owns a listening
//! socket's bind/accept lifecycle (spec.md §4.4); every accepted or
//! outbound-connected socket is wrapped in a [`channel::Channel`] (spec.md
//! §4.6), backed by a per-connection [`processor`] state machine (spec.md
//! §4.5) and a pair of bounded handoff buffers from `conduit_comm`.

pub mod acceptor;
pub mod channel;
pub mod codec;
pub mod config;
pub mod future;
pub(crate) mod processor;
pub mod reactor;

pub use acceptor::{ConnectionFactories, TcpAcceptor, TlsAcceptor, TlsConnectionFactories};
pub use channel::Channel;
pub use codec::{ChecksumAlgorithm, ChecksumCodec, Codec, Crc32, IntLengthCodec, ShortLengthCodec};
pub use config::{NetworkConfig, ReactorPoolConfig};
pub use future::{CompletionFuture, Completion, Outcome};
pub use reactor::{SelectorPool, WriteOutcome, WriteRearm};

pub use conduit_comm::{
    Attachment, BindError, BufferError, BufferProvider, BufferProviderConfig, ChannelError, CodecError, Consumer,
    EchoTarget, HandoffBuffer, Producer, RateLimiter, SharedInputGroup,
};
