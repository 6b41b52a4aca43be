//! See [`Event`].

use crate::{packet::Packet, peer::PeerId};

/// Something the host wants the application to know about, surfaced from
/// [`Host::service`](crate::host::Host::service) and
/// [`Host::check_events`](crate::host::Host::check_events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection completed, whether we or the remote initiated it.
    Connect {
        /// Peer the connection belongs to.
        peer: PeerId,
        /// User value the remote supplied when connecting.
        data: u32,
    },
    /// A connection ended: by request, by timeout, or by protocol error.
    /// The peer slot has already been reset.
    Disconnect {
        /// Peer the connection belonged to.
        peer: PeerId,
        /// User value the remote supplied when disconnecting, or 0.
        data: u32,
    },
    /// A message arrived.
    Receive {
        /// Peer that sent the message.
        peer: PeerId,
        /// Channel the message arrived on.
        channel_id: u8,
        /// The reassembled message payload.
        packet: Packet,
    },
}
