//! The twelve protocol commands and their packed encodings.
//!
//! Every command starts with a 4-byte header: one byte packing the opcode
//! (low 4 bits) and the [`CommandFlags`] (high bits), the channel ID, and a
//! big-endian reliable sequence number. Opcode-specific fields follow,
//! packed and big-endian. Commands that carry payload data (the `Send*`
//! family) are followed on the wire by `data_length` raw payload bytes which
//! are *not* part of the command encoding itself.

use core::convert::Infallible;

use octs::{BufTooShortOr, Encode, Read, Write};

/// Bits of the opcode byte that select the [`Opcode`].
pub const COMMAND_MASK: u8 = 0x0F;
/// Size of the common command header.
pub const COMMAND_HEADER_LEN: usize = 4;

/// Flag bits carried in the high bits of the opcode byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags(pub u8);

impl CommandFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The receiver must acknowledge this command.
    pub const ACKNOWLEDGE: Self = Self(0x80);
    /// This command is outside any sequencing discipline.
    pub const UNSEQUENCED: Self = Self(0x40);
    /// All bits that may legally be set.
    pub const MASK: u8 = 0xC0;

    /// Whether the receiver must acknowledge the command.
    #[must_use]
    pub const fn wants_acknowledge(self) -> bool {
        self.0 & Self::ACKNOWLEDGE.0 != 0
    }

    /// Whether the command bypasses sequencing.
    #[must_use]
    pub const fn is_unsequenced(self) -> bool {
        self.0 & Self::UNSEQUENCED.0 != 0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Command opcodes, as carried in the low 4 bits of the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Acknowledges one reliable command.
    Acknowledge = 1,
    /// Opens a connection; the only command a stranger may send.
    Connect = 2,
    /// Accepts a connection, echoing the negotiated parameters.
    VerifyConnect = 3,
    /// Closes a connection.
    Disconnect = 4,
    /// Keepalive; elicits an acknowledgement.
    Ping = 5,
    /// One reliable message, delivered exactly once and in order.
    SendReliable = 6,
    /// One unreliable message, dropped if late.
    SendUnreliable = 7,
    /// One fragment of an oversized reliable message.
    SendFragment = 8,
    /// One message outside all ordering, deduplicated by group.
    SendUnsequenced = 9,
    /// Advertises the sender's bandwidth limits.
    BandwidthLimit = 10,
    /// Reconfigures the receiver's send throttle.
    ThrottleConfigure = 11,
    /// One fragment of an oversized unreliable message.
    SendUnreliableFragment = 12,
}

impl Opcode {
    /// Decodes an opcode from the low bits of an opcode byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte & COMMAND_MASK {
            1 => Self::Acknowledge,
            2 => Self::Connect,
            3 => Self::VerifyConnect,
            4 => Self::Disconnect,
            5 => Self::Ping,
            6 => Self::SendReliable,
            7 => Self::SendUnreliable,
            8 => Self::SendFragment,
            9 => Self::SendUnsequenced,
            10 => Self::BandwidthLimit,
            11 => Self::ThrottleConfigure,
            12 => Self::SendUnreliableFragment,
            _ => return None,
        })
    }

    /// Wire size of a command with this opcode, including the 4-byte command
    /// header but excluding any trailing payload bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Acknowledge => 8,
            Self::Connect => 48,
            Self::VerifyConnect => 44,
            Self::Disconnect => 8,
            Self::Ping => 4,
            Self::SendReliable => 6,
            Self::SendUnreliable => 8,
            Self::SendFragment | Self::SendUnreliableFragment => 24,
            Self::SendUnsequenced => 8,
            Self::BandwidthLimit => 12,
            Self::ThrottleConfigure => 16,
        }
    }
}

/// Connection request parameters.
///
/// Sent on the control channel by an initiating host; the responder answers
/// with a [`VerifyConnect`] echoing what it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    /// Peer ID the initiator assigned to this connection on its side.
    pub outgoing_peer_id: u16,
    /// Session nibble the initiator proposes for traffic it receives.
    pub incoming_session_id: u8,
    /// Session nibble the initiator proposes for traffic it sends.
    pub outgoing_session_id: u8,
    /// Initiator's MTU.
    pub mtu: u32,
    /// Initiator's reliable byte window.
    pub window_size: u32,
    /// Number of channels the initiator wants.
    pub channel_count: u32,
    /// Initiator's incoming bandwidth in bytes/sec, 0 for unlimited.
    pub incoming_bandwidth: u32,
    /// Initiator's outgoing bandwidth in bytes/sec, 0 for unlimited.
    pub outgoing_bandwidth: u32,
    /// Throttle measurement interval in milliseconds.
    pub packet_throttle_interval: u32,
    /// Throttle acceleration, in units of 1/32 per measurement.
    pub packet_throttle_acceleration: u32,
    /// Throttle deceleration, in units of 1/32 per measurement.
    pub packet_throttle_deceleration: u32,
    /// Random ID tying the VERIFY_CONNECT (and checksums) to this attempt.
    pub connect_id: u32,
    /// Opaque user value surfaced with the remote's connect event.
    pub data: u32,
}

/// Connection acceptance parameters; field meanings as in [`Connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VerifyConnect {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Placement of one fragment within an oversized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFragment {
    /// Sequence number of the first fragment of the message.
    pub start_sequence_number: u16,
    /// Length of this fragment's payload.
    pub data_length: u16,
    /// Total number of fragments in the message.
    pub fragment_count: u32,
    /// Index of this fragment.
    pub fragment_number: u32,
    /// Total reassembled length of the message.
    pub total_length: u32,
    /// Byte offset of this fragment within the message.
    pub fragment_offset: u32,
}

/// Opcode-specific fields of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandInfo {
    /// See [`Opcode::Acknowledge`].
    Acknowledge {
        /// Reliable sequence number being acknowledged.
        received_reliable_sequence_number: u16,
        /// Echo of the sender's timestamp from the acknowledged datagram.
        received_sent_time: u16,
    },
    /// See [`Opcode::Connect`].
    Connect(Connect),
    /// See [`Opcode::VerifyConnect`].
    VerifyConnect(VerifyConnect),
    /// See [`Opcode::Disconnect`].
    Disconnect {
        /// Opaque user value surfaced with the remote's disconnect event.
        data: u32,
    },
    /// See [`Opcode::Ping`].
    Ping,
    /// See [`Opcode::SendReliable`].
    SendReliable {
        /// Length of the payload following the command.
        data_length: u16,
    },
    /// See [`Opcode::SendUnreliable`].
    SendUnreliable {
        /// Position of this message in the channel's unreliable stream.
        unreliable_sequence_number: u16,
        /// Length of the payload following the command.
        data_length: u16,
    },
    /// See [`Opcode::SendFragment`].
    SendFragment(SendFragment),
    /// See [`Opcode::SendUnsequenced`].
    SendUnsequenced {
        /// Duplicate-rejection group of this message.
        unsequenced_group: u16,
        /// Length of the payload following the command.
        data_length: u16,
    },
    /// See [`Opcode::BandwidthLimit`].
    BandwidthLimit {
        /// Sender's incoming bandwidth in bytes/sec, 0 for unlimited.
        incoming_bandwidth: u32,
        /// Sender's outgoing bandwidth in bytes/sec, 0 for unlimited.
        outgoing_bandwidth: u32,
    },
    /// See [`Opcode::ThrottleConfigure`].
    ThrottleConfigure {
        /// Throttle measurement interval in milliseconds.
        packet_throttle_interval: u32,
        /// Throttle acceleration, in units of 1/32 per measurement.
        packet_throttle_acceleration: u32,
        /// Throttle deceleration, in units of 1/32 per measurement.
        packet_throttle_deceleration: u32,
    },
    /// See [`Opcode::SendUnreliableFragment`].
    SendUnreliableFragment(SendFragment),
}

impl CommandInfo {
    /// Opcode selecting this variant.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Acknowledge { .. } => Opcode::Acknowledge,
            Self::Connect(_) => Opcode::Connect,
            Self::VerifyConnect(_) => Opcode::VerifyConnect,
            Self::Disconnect { .. } => Opcode::Disconnect,
            Self::Ping => Opcode::Ping,
            Self::SendReliable { .. } => Opcode::SendReliable,
            Self::SendUnreliable { .. } => Opcode::SendUnreliable,
            Self::SendFragment(_) => Opcode::SendFragment,
            Self::SendUnsequenced { .. } => Opcode::SendUnsequenced,
            Self::BandwidthLimit { .. } => Opcode::BandwidthLimit,
            Self::ThrottleConfigure { .. } => Opcode::ThrottleConfigure,
            Self::SendUnreliableFragment(_) => Opcode::SendUnreliableFragment,
        }
    }
}

/// One fully decoded protocol command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Flag bits from the opcode byte.
    pub flags: CommandFlags,
    /// Channel the command acts on; `0xFF` is the control channel.
    pub channel_id: u8,
    /// Reliable sequence number from the command header.
    pub reliable_sequence_number: u16,
    /// Opcode-specific fields.
    pub info: CommandInfo,
}

/// Command could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCommand {
    /// Opcode byte does not name a known command.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// Buffer ended inside the command.
    #[error("truncated command")]
    Truncated,
}

impl Command {
    /// Wire size of this command, including the command header but excluding
    /// trailing payload bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.info.opcode().size()
    }

    /// Decodes one command from the front of `src`.
    ///
    /// # Errors
    ///
    /// Errors on an unknown opcode or a buffer that ends inside the command.
    pub fn decode(src: &mut impl Read) -> Result<Self, InvalidCommand> {
        macro_rules! read {
            () => {
                src.read().map_err(|_| InvalidCommand::Truncated)?
            };
        }

        let opcode_byte: u8 = read!();
        let opcode =
            Opcode::from_byte(opcode_byte).ok_or(InvalidCommand::UnknownOpcode(opcode_byte))?;
        let flags = CommandFlags(opcode_byte & CommandFlags::MASK);
        let channel_id = read!();
        let reliable_sequence_number = read!();

        let info = match opcode {
            Opcode::Acknowledge => CommandInfo::Acknowledge {
                received_reliable_sequence_number: read!(),
                received_sent_time: read!(),
            },
            Opcode::Connect => CommandInfo::Connect(Connect {
                outgoing_peer_id: read!(),
                incoming_session_id: read!(),
                outgoing_session_id: read!(),
                mtu: read!(),
                window_size: read!(),
                channel_count: read!(),
                incoming_bandwidth: read!(),
                outgoing_bandwidth: read!(),
                packet_throttle_interval: read!(),
                packet_throttle_acceleration: read!(),
                packet_throttle_deceleration: read!(),
                connect_id: read!(),
                data: read!(),
            }),
            Opcode::VerifyConnect => CommandInfo::VerifyConnect(VerifyConnect {
                outgoing_peer_id: read!(),
                incoming_session_id: read!(),
                outgoing_session_id: read!(),
                mtu: read!(),
                window_size: read!(),
                channel_count: read!(),
                incoming_bandwidth: read!(),
                outgoing_bandwidth: read!(),
                packet_throttle_interval: read!(),
                packet_throttle_acceleration: read!(),
                packet_throttle_deceleration: read!(),
                connect_id: read!(),
            }),
            Opcode::Disconnect => CommandInfo::Disconnect { data: read!() },
            Opcode::Ping => CommandInfo::Ping,
            Opcode::SendReliable => CommandInfo::SendReliable {
                data_length: read!(),
            },
            Opcode::SendUnreliable => CommandInfo::SendUnreliable {
                unreliable_sequence_number: read!(),
                data_length: read!(),
            },
            Opcode::SendUnsequenced => CommandInfo::SendUnsequenced {
                unsequenced_group: read!(),
                data_length: read!(),
            },
            Opcode::BandwidthLimit => CommandInfo::BandwidthLimit {
                incoming_bandwidth: read!(),
                outgoing_bandwidth: read!(),
            },
            Opcode::ThrottleConfigure => CommandInfo::ThrottleConfigure {
                packet_throttle_interval: read!(),
                packet_throttle_acceleration: read!(),
                packet_throttle_deceleration: read!(),
            },
            Opcode::SendFragment | Opcode::SendUnreliableFragment => {
                let fragment = SendFragment {
                    start_sequence_number: read!(),
                    data_length: read!(),
                    fragment_count: read!(),
                    fragment_number: read!(),
                    total_length: read!(),
                    fragment_offset: read!(),
                };
                if opcode == Opcode::SendFragment {
                    CommandInfo::SendFragment(fragment)
                } else {
                    CommandInfo::SendUnreliableFragment(fragment)
                }
            }
        };

        Ok(Self {
            flags,
            channel_id,
            reliable_sequence_number,
            info,
        })
    }
}

impl Encode for Command {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&(self.info.opcode() as u8 | self.flags.0))?;
        dst.write(&self.channel_id)?;
        dst.write(&self.reliable_sequence_number)?;
        match &self.info {
            CommandInfo::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                dst.write(received_reliable_sequence_number)?;
                dst.write(received_sent_time)?;
            }
            CommandInfo::Connect(c) => {
                dst.write(&c.outgoing_peer_id)?;
                dst.write(&c.incoming_session_id)?;
                dst.write(&c.outgoing_session_id)?;
                dst.write(&c.mtu)?;
                dst.write(&c.window_size)?;
                dst.write(&c.channel_count)?;
                dst.write(&c.incoming_bandwidth)?;
                dst.write(&c.outgoing_bandwidth)?;
                dst.write(&c.packet_throttle_interval)?;
                dst.write(&c.packet_throttle_acceleration)?;
                dst.write(&c.packet_throttle_deceleration)?;
                dst.write(&c.connect_id)?;
                dst.write(&c.data)?;
            }
            CommandInfo::VerifyConnect(c) => {
                dst.write(&c.outgoing_peer_id)?;
                dst.write(&c.incoming_session_id)?;
                dst.write(&c.outgoing_session_id)?;
                dst.write(&c.mtu)?;
                dst.write(&c.window_size)?;
                dst.write(&c.channel_count)?;
                dst.write(&c.incoming_bandwidth)?;
                dst.write(&c.outgoing_bandwidth)?;
                dst.write(&c.packet_throttle_interval)?;
                dst.write(&c.packet_throttle_acceleration)?;
                dst.write(&c.packet_throttle_deceleration)?;
                dst.write(&c.connect_id)?;
            }
            CommandInfo::Disconnect { data } => {
                dst.write(data)?;
            }
            CommandInfo::Ping => {}
            CommandInfo::SendReliable { data_length } => {
                dst.write(data_length)?;
            }
            CommandInfo::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                dst.write(unreliable_sequence_number)?;
                dst.write(data_length)?;
            }
            CommandInfo::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                dst.write(unsequenced_group)?;
                dst.write(data_length)?;
            }
            CommandInfo::SendFragment(f) | CommandInfo::SendUnreliableFragment(f) => {
                dst.write(&f.start_sequence_number)?;
                dst.write(&f.data_length)?;
                dst.write(&f.fragment_count)?;
                dst.write(&f.fragment_number)?;
                dst.write(&f.total_length)?;
                dst.write(&f.fragment_offset)?;
            }
            CommandInfo::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                dst.write(incoming_bandwidth)?;
                dst.write(outgoing_bandwidth)?;
            }
            CommandInfo::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                dst.write(packet_throttle_interval)?;
                dst.write(packet_throttle_acceleration)?;
                dst.write(packet_throttle_deceleration)?;
            }
        }
        Ok(())
    }
}

// The size table is load-bearing on both the send path (datagram packing)
// and the receive path (pre-decode validation); pin the encodings to it.
static_assertions::const_assert_eq!(Opcode::Ping.size(), COMMAND_HEADER_LEN);
static_assertions::const_assert_eq!(Opcode::Acknowledge.size(), COMMAND_HEADER_LEN + 4);
static_assertions::const_assert_eq!(Opcode::Connect.size(), COMMAND_HEADER_LEN + 44);
static_assertions::const_assert_eq!(Opcode::VerifyConnect.size(), COMMAND_HEADER_LEN + 40);
static_assertions::const_assert_eq!(Opcode::Disconnect.size(), COMMAND_HEADER_LEN + 4);
static_assertions::const_assert_eq!(Opcode::SendReliable.size(), COMMAND_HEADER_LEN + 2);
static_assertions::const_assert_eq!(Opcode::SendUnreliable.size(), COMMAND_HEADER_LEN + 4);
static_assertions::const_assert_eq!(Opcode::SendFragment.size(), COMMAND_HEADER_LEN + 20);
static_assertions::const_assert_eq!(Opcode::SendUnsequenced.size(), COMMAND_HEADER_LEN + 4);
static_assertions::const_assert_eq!(Opcode::BandwidthLimit.size(), COMMAND_HEADER_LEN + 8);
static_assertions::const_assert_eq!(Opcode::ThrottleConfigure.size(), COMMAND_HEADER_LEN + 12);

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use octs::{Bytes, Write};

    use super::*;

    fn round_trip(v: &Command) {
        let mut buf = BytesMut::new();
        buf.write(v).unwrap();
        assert_eq!(v.size(), buf.len());
        let mut buf: Bytes = buf.freeze();
        assert_eq!(*v, Command::decode(&mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_decode_acknowledge() {
        round_trip(&Command {
            flags: CommandFlags::NONE,
            channel_id: 3,
            reliable_sequence_number: 7,
            info: CommandInfo::Acknowledge {
                received_reliable_sequence_number: 42,
                received_sent_time: 0x1234,
            },
        });
    }

    #[test]
    fn encode_decode_connect() {
        round_trip(&Command {
            flags: CommandFlags::NONE,
            channel_id: 0xFF,
            reliable_sequence_number: 1,
            info: CommandInfo::Connect(Connect {
                outgoing_peer_id: 0,
                incoming_session_id: 0xFF,
                outgoing_session_id: 0xFF,
                mtu: 1400,
                window_size: 0x8000,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 57600,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEAD_BEEF,
                data: 99,
            }),
        });
    }

    #[test]
    fn encode_decode_verify_connect() {
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 1,
            info: CommandInfo::VerifyConnect(VerifyConnect {
                outgoing_peer_id: 5,
                incoming_session_id: 1,
                outgoing_session_id: 2,
                mtu: 1400,
                window_size: 0x8000,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEAD_BEEF,
            }),
        });
    }

    #[test]
    fn encode_decode_send_family() {
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 9,
            info: CommandInfo::SendReliable { data_length: 1000 },
        });
        round_trip(&Command {
            flags: CommandFlags::NONE,
            channel_id: 1,
            reliable_sequence_number: 9,
            info: CommandInfo::SendUnreliable {
                unreliable_sequence_number: 4,
                data_length: 12,
            },
        });
        round_trip(&Command {
            flags: CommandFlags::UNSEQUENCED,
            channel_id: 2,
            reliable_sequence_number: 0,
            info: CommandInfo::SendUnsequenced {
                unsequenced_group: 77,
                data_length: 3,
            },
        });
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 10,
            info: CommandInfo::SendFragment(SendFragment {
                start_sequence_number: 10,
                data_length: 500,
                fragment_count: 9,
                fragment_number: 4,
                total_length: 4096,
                fragment_offset: 2000,
            }),
        });
    }

    #[test]
    fn encode_decode_control_family() {
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 2,
            info: CommandInfo::Ping,
        });
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 3,
            info: CommandInfo::Disconnect { data: 1 },
        });
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 4,
            info: CommandInfo::BandwidthLimit {
                incoming_bandwidth: 1000,
                outgoing_bandwidth: 2000,
            },
        });
        round_trip(&Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 5,
            info: CommandInfo::ThrottleConfigure {
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
            },
        });
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut buf = Bytes::from_static(&[0x0D, 0x00, 0x00, 0x00]);
        assert_matches!(
            Command::decode(&mut buf),
            Err(InvalidCommand::UnknownOpcode(0x0D))
        );

        let mut buf = Bytes::from_static(&[0x00, 0x00, 0x00, 0x00]);
        assert_matches!(
            Command::decode(&mut buf),
            Err(InvalidCommand::UnknownOpcode(0x00))
        );
    }

    #[test]
    fn rejects_truncated() {
        // a PING cut off inside its header
        let mut buf = Bytes::from_static(&[0x85, 0xFF, 0x00]);
        assert_matches!(Command::decode(&mut buf), Err(InvalidCommand::Truncated));

        // an ACKNOWLEDGE cut off inside its fields
        let mut buf = Bytes::from_static(&[0x01, 0x00, 0x00, 0x01, 0x00]);
        assert_matches!(Command::decode(&mut buf), Err(InvalidCommand::Truncated));
    }

    #[test]
    fn flag_bits_survive() {
        let mut buf = BytesMut::new();
        buf.write(&Command {
            flags: CommandFlags::ACKNOWLEDGE.with(CommandFlags::UNSEQUENCED),
            channel_id: 0,
            reliable_sequence_number: 0,
            info: CommandInfo::Ping,
        })
        .unwrap();
        assert_eq!(0xC5, buf[0]);
    }
}
