//! Reliable multi-channel message transport over a single UDP socket.
//!
//! squall multiplexes any number of logical connections ([peers](peer))
//! over one datagram [socket], and any number of independent in-order
//! lanes (channels) over each connection. Every message picks its own
//! delivery mode:
//!
//! - **reliable**: delivered exactly once, in order, retransmitted with
//!   exponential back-off until acknowledged;
//! - **unreliable sequenced**: delivered at most once; arrivals that the
//!   stream has already moved past are dropped;
//! - **unsequenced**: delivered outside all ordering, deduplicated within
//!   a sliding window;
//! - oversized messages fragment transparently under either reliable or
//!   unreliable semantics.
//!
//! A [`Host`] owns the socket and a fixed array of peer slots, and runs a
//! single-threaded cooperative [service loop](Host::service) that performs
//! connection handshakes, round-trip-time estimation, adaptive send
//! throttling, cross-peer bandwidth fairness, retransmission, and optional
//! per-datagram [compression](squall_proto::compress) and
//! [checksumming](squall_proto::checksum).
//!
//! ```no_run
//! use squall::{Event, Host, HostConfig, Packet};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut host = Host::bind("0.0.0.0:4100".parse().unwrap(), HostConfig::default())?;
//! host.connect("10.0.0.2:4100".parse().unwrap(), 2, 0).unwrap();
//!
//! loop {
//!     match host.service(50)? {
//!         Some(Event::Connect { peer, .. }) => {
//!             host.send(peer, 0, Packet::reliable(&b"hello"[..])).unwrap();
//!         }
//!         Some(Event::Receive { packet, .. }) => {
//!             println!("got {} bytes", packet.len());
//!         }
//!         Some(Event::Disconnect { .. }) => break,
//!         None => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod event;
pub mod host;
pub mod packet;
pub mod peer;
pub mod socket;
pub mod time;

mod channel;
mod command;
mod protocol;

pub use squall_proto as proto;

pub use crate::{
    event::Event,
    host::{ConnectError, Host, HostConfig, Intercept},
    packet::{Packet, PacketFlags},
    peer::{Peer, PeerId, PeerState, SendError},
};
