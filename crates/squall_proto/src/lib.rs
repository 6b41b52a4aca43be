//! Wire protocol layer for the squall transport.
//!
//! This crate defines the frozen on-wire representation shared by every
//! squall endpoint, independently of any I/O or connection state:
//! - the [datagram header](header) with its packed peer-ID / session / flag
//!   field,
//! - the twelve [commands](command) that a datagram carries, with their
//!   fixed big-endian encodings and the per-opcode size table,
//! - the default per-datagram [checksum](checksum) (reflected CRC-32) and
//!   [compressor](compress) (order-2 adaptive PPM range coder), both behind
//!   adapter traits so hosts can substitute their own.
//!
//! Everything here is bit-exact: an encoded value decodes to an identical
//! value, and the size table agrees with the encodings at compile time.

pub mod checksum;
pub mod command;
pub mod compress;
pub mod header;

/// Smallest datagram size every link must carry without fragmenting.
pub const MINIMUM_MTU: u32 = 576;
/// Largest datagram size the protocol will produce.
pub const MAXIMUM_MTU: u32 = 4096;
/// Most commands that may be packed into one outgoing datagram.
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
/// Smallest in-flight reliable byte window a peer may negotiate.
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
/// Largest in-flight reliable byte window a peer may negotiate.
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
/// Fewest channels a connection may carry.
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
/// Most channels a connection may carry.
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
/// Largest addressable peer ID; doubles as the "no peer" header value.
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
/// Most fragments one oversized message may be split into.
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;
