use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::EchoTarget;

/// Opaque per-slot side-channel carried alongside a [`crate::payload::Payload`].
///
/// Neither the ring nor the lock+condition buffer interprets this value; it
/// is set by whichever party produces a slot and read by whichever party
/// consumes it. UDP processors attach a peer address; TCP/TLS read paths
/// attach a back-reference to the output buffer so an echo handler can
/// re-publish a reply without threading the channel through call arguments.
#[derive(Clone, Debug, Default)]
pub enum Attachment {
    #[default]
    None,
    PeerAddr(SocketAddr),
    Echo(Arc<dyn EchoTarget>),
}

impl Attachment {
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Attachment::PeerAddr(addr) => Some(*addr),
            _ => None,
        }
    }

    #[must_use]
    pub fn echo_target(&self) -> Option<&Arc<dyn EchoTarget>> {
        match self {
            Attachment::Echo(target) => Some(target),
            _ => None,
        }
    }
}
