//! In-memory command records moving through a peer's queues.

use bitvec::vec::BitVec;
use bytes::{Bytes, BytesMut};
use squall_proto::command::{Command, Opcode};

use crate::packet::{Packet, PacketFlags};

/// An outgoing command queued for the wire, together with the retry
/// bookkeeping that keeps it alive until acknowledged (for reliable
/// commands) or sent once (for the rest).
#[derive(Debug, Clone)]
pub(crate) struct OutgoingCommand {
    /// The wire command; its sequence fields mirror the ones below.
    pub command: Command,
    /// Sequence number in the channel's (or control channel's) reliable
    /// stream.
    pub reliable_sequence_number: u16,
    /// Sequence number in the channel's unreliable stream, if any.
    pub unreliable_sequence_number: u16,
    /// Service time at which the command was last put on the wire.
    pub sent_time: u32,
    /// Retransmission deadline; doubled on every retry.
    pub round_trip_timeout: u32,
    /// Ceiling on the doubled timeout before the peer is declared dead.
    pub round_trip_timeout_limit: u32,
    /// How many times this command has been put on the wire.
    pub send_attempts: u16,
    /// Offset of this command's slice of the packet payload.
    pub fragment_offset: u32,
    /// Length of this command's slice of the packet payload.
    pub fragment_length: u16,
    /// Payload buffer shared with every other fragment of the message.
    pub packet: Option<Packet>,
}

impl OutgoingCommand {
    pub fn new(command: Command, packet: Option<Packet>, offset: u32, length: u16) -> Self {
        Self {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            send_attempts: 0,
            fragment_offset: offset,
            fragment_length: length,
            packet,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.command.info.opcode()
    }

    /// The slice of the shared payload this command carries.
    pub fn payload(&self) -> Option<Bytes> {
        self.packet.as_ref().map(|packet| {
            let start = self.fragment_offset as usize;
            packet.share_data().slice(start..start + usize::from(self.fragment_length))
        })
    }
}

/// A received command held in a channel queue until it can be dispatched
/// in order, or (for fragments) until the whole message has arrived.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    /// The wire command as received; for reassemblies, the first-seen
    /// fragment command with its sequence rewritten to the start sequence.
    pub command: Command,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    /// Total fragments in the message; 0 for unfragmented commands.
    pub fragment_count: u32,
    /// Fragments still missing; dispatchable at 0.
    pub fragments_remaining: u32,
    /// Which fragments have arrived, for duplicate rejection.
    pub fragments: Option<BitVec<u32>>,
    /// Payload buffer; fragments are copied in at their offsets.
    pub payload: BytesMut,
    /// Flags for the packet eventually handed to the application.
    pub packet_flags: PacketFlags,
}

impl IncomingCommand {
    pub fn opcode(&self) -> Opcode {
        self.command.info.opcode()
    }

    pub fn is_unsequenced(&self) -> bool {
        self.opcode() == Opcode::SendUnsequenced
    }

    /// Converts the (complete) command into the application-facing packet.
    pub fn into_packet(self) -> Packet {
        Packet::new(self.payload.freeze(), self.packet_flags)
    }
}

/// A pending acknowledgement of one received reliable command, flushed
/// with the next outgoing datagram.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acknowledgement {
    /// Opcode of the command being acknowledged.
    pub opcode: Opcode,
    /// Channel of the command being acknowledged.
    pub channel_id: u8,
    /// Reliable sequence number being acknowledged.
    pub reliable_sequence_number: u16,
    /// Sender timestamp echoed back for its RTT measurement.
    pub sent_time: u16,
}
