//! Per-peer connection state and the queueing discipline behind it.
//!
//! A [`Peer`] is one end of one connection: its state machine, its channel
//! array, its six command queues, and the statistics (round-trip time,
//! throttle, packet loss) that drive retransmission and rate control. The
//! datagram-level work of putting commands on the wire and accepting them
//! off it lives in the host's service loop; everything here is reachable
//! without I/O, which is what the unit tests exercise.

use std::{collections::VecDeque, net::SocketAddr};

use bitvec::{array::BitArray, bitvec, order::Lsb0};
use bytes::BytesMut;
use squall_proto::{
    command::{Command, CommandFlags, CommandInfo, Opcode},
    MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
};
use tracing::trace;

use crate::{
    channel::{
        reliable_window, window_acceptable, Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE,
    },
    command::{Acknowledgement, IncomingCommand, OutgoingCommand},
    packet::{Packet, PacketFlags},
    time::{time_difference, time_less},
};

/// Units of the packet throttle: a throttle of 32 sends every unreliable
/// command, 16 sends half of them.
pub const PACKET_THROTTLE_SCALE: u32 = 32;
/// Default throttle measurement interval in milliseconds.
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
/// Default throttle acceleration per favorable measurement.
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
/// Default throttle deceleration per unfavorable measurement.
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
/// Default keepalive interval in milliseconds.
pub const PING_INTERVAL: u32 = 500;
/// Default multiplier bounding how far a reliable command's retransmission
/// timeout may grow before the peer is declared dead.
pub const TIMEOUT_LIMIT: u32 = 32;
/// Default floor on the silent interval before a timeout disconnect.
pub const TIMEOUT_MINIMUM: u32 = 5000;
/// Default ceiling on the silent interval before a timeout disconnect.
pub const TIMEOUT_MAXIMUM: u32 = 30_000;

pub(crate) const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub(crate) const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub(crate) const PACKET_THROTTLE_COUNTER: u32 = 7;
pub(crate) const PACKET_LOSS_SCALE: u32 = 1 << 16;
pub(crate) const PACKET_LOSS_INTERVAL: u32 = 10_000;
pub(crate) const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub(crate) const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub(crate) const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

/// Handle naming one peer slot of a [`Host`](crate::host::Host).
///
/// Handles stay valid for the lifetime of the host; a slot is recycled for
/// new connections once its previous connection fully disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) u16);

impl PeerId {
    /// Index of the slot within the host's peer array.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Connection state of a [`Peer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerState {
    /// Slot is free.
    #[default]
    Disconnected,
    /// We sent CONNECT and await VERIFY_CONNECT.
    Connecting,
    /// We answered a CONNECT and await the acknowledgement of our
    /// VERIFY_CONNECT.
    AcknowledgingConnect,
    /// Handshake finished on the responder side; the connect event has not
    /// been handed to the application yet.
    ConnectionPending,
    /// Handshake finished on the initiator side; the connect event has not
    /// been handed to the application yet.
    ConnectionSucceeded,
    /// Fully connected.
    Connected,
    /// Disconnect requested, draining queued outgoing data first.
    DisconnectLater,
    /// DISCONNECT sent and awaiting its acknowledgement.
    Disconnecting,
    /// Remote's DISCONNECT accepted; our acknowledgement of it is queued.
    AcknowledgingDisconnect,
    /// Connection is dead but its disconnect event has not been dispatched
    /// yet.
    Zombie,
}

/// How a received command was treated by
/// [`Peer::queue_incoming_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Inserted; `index` locates the command in its channel queue until
    /// dispatch runs.
    Accepted {
        /// Position within the queue the command was inserted into.
        index: usize,
    },
    /// Duplicate or stale; silently dropped.
    Discarded,
    /// Out of resources or a protocol violation; the datagram must be
    /// abandoned.
    Refused,
}

/// Failure to queue an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The peer is not in the [`PeerState::Connected`] state.
    #[error("peer not connected")]
    NotConnected,
    /// The channel ID names no channel on this connection.
    #[error("invalid channel")]
    InvalidChannel,
    /// The payload exceeds the host's maximum packet size, or needs more
    /// fragments than the protocol can number.
    #[error("packet too large")]
    PacketTooLarge,
}

type UnsequencedWindow = BitArray<[u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize], Lsb0>;

/// One end of one connection multiplexed over a host's socket.
///
/// Applications interact with peers through their [`Host`]; the accessors
/// here expose connection statistics and negotiated parameters.
///
/// [`Host`]: crate::host::Host
#[derive(Debug)]
pub struct Peer {
    pub(crate) incoming_peer_id: u16,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,
    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,
    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_interval: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) last_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    /// Reliable sequence counter of the control channel (0xFF).
    pub(crate) outgoing_reliable_sequence_number: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) unsequenced_window: UnsequencedWindow,
    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,
    pub(crate) needs_dispatch: bool,
    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, mtu: u32) -> Self {
        let mut peer = Self {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            highest_round_trip_time_variance: 0,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            outgoing_reliable_sequence_number: 0,
            outgoing_unsequenced_group: 0,
            incoming_unsequenced_group: 0,
            unsequenced_window: BitArray::ZERO,
            event_data: 0,
            total_waiting_data: 0,
            needs_dispatch: false,
            acknowledgements: VecDeque::new(),
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
        };
        peer.reset(mtu);
        peer
    }

    /// Connection state.
    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    /// Remote address, once known.
    #[must_use]
    pub const fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Smoothed round-trip time in milliseconds.
    #[must_use]
    pub const fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Variance of the round-trip time in milliseconds.
    #[must_use]
    pub const fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Smoothed loss ratio in units of `1 / 2^16`.
    #[must_use]
    pub const fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    /// Variance of the loss ratio in units of `1 / 2^16`.
    #[must_use]
    pub const fn packet_loss_variance(&self) -> u32 {
        self.packet_loss_variance
    }

    /// Negotiated maximum datagram size.
    #[must_use]
    pub const fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Number of channels on this connection.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Current send throttle in units of
    /// [1/32](`PACKET_THROTTLE_SCALE`).
    #[must_use]
    pub const fn packet_throttle(&self) -> u32 {
        self.packet_throttle
    }

    /// Overrides the adaptive send throttle, in units of
    /// [1/32](`PACKET_THROTTLE_SCALE`). The throttle keeps adapting from
    /// the new value as acknowledgements arrive.
    pub fn set_packet_throttle(&mut self, throttle: u32) {
        self.packet_throttle = throttle.min(PACKET_THROTTLE_SCALE);
    }

    /// Bytes of reliable data on the wire awaiting acknowledgement.
    #[must_use]
    pub const fn reliable_data_in_transit(&self) -> u32 {
        self.reliable_data_in_transit
    }

    /// Whether any outgoing command is queued or awaiting acknowledgement.
    #[must_use]
    pub fn has_pending_outgoing(&self) -> bool {
        self.has_outgoing_commands()
    }

    /// ID identifying this connection attempt in the handshake and in
    /// checksummed datagrams.
    #[must_use]
    pub const fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Keepalive interval in milliseconds.
    pub fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval == 0 { PING_INTERVAL } else { interval };
    }

    /// Timeout parameters for declaring the connection dead: the
    /// retransmission-limit multiplier and the minimum and maximum silent
    /// intervals in milliseconds. Zero restores a parameter's default.
    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit == 0 { TIMEOUT_LIMIT } else { limit };
        self.timeout_minimum = if minimum == 0 { TIMEOUT_MINIMUM } else { minimum };
        self.timeout_maximum = if maximum == 0 { TIMEOUT_MAXIMUM } else { maximum };
    }

    /// Clears all connection state except the slot identity and session
    /// nibbles, returning the slot to [`PeerState::Disconnected`].
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.address = None;
        self.state = PeerState::Disconnected;
        self.mtu = host_mtu;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.reliable_data_in_transit = 0;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.highest_round_trip_time_variance = 0;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.outgoing_unsequenced_group = 0;
        self.incoming_unsequenced_group = 0;
        self.unsequenced_window = BitArray::ZERO;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.reset_queues();
    }

    /// Drops every queued command and channel. The host is responsible for
    /// pulling the peer out of its dispatch queue first.
    pub(crate) fn reset_queues(&mut self) {
        self.acknowledgements.clear();
        self.outgoing_reliable_commands.clear();
        self.outgoing_unreliable_commands.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    pub(crate) fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_reliable_commands.is_empty()
            || !self.outgoing_unreliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    /// Queues `packet` for delivery on `channel_id`, choosing the command
    /// type from the packet flags and fragmenting if the payload exceeds
    /// one datagram.
    pub(crate) fn send(
        &mut self,
        channel_id: u8,
        packet: Packet,
        checksum_installed: bool,
        maximum_packet_size: usize,
    ) -> Result<(), SendError> {
        if self.state != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if usize::from(channel_id) >= self.channels.len() {
            return Err(SendError::InvalidChannel);
        }
        if packet.len() > maximum_packet_size {
            return Err(SendError::PacketTooLarge);
        }

        let fragment_length = self.mtu as usize
            - squall_proto::header::DatagramHeader::FULL_LEN
            - Opcode::SendFragment.size()
            - if checksum_installed { 4 } else { 0 };

        if packet.len() > fragment_length {
            return self.send_fragmented(channel_id, packet, fragment_length);
        }

        let data_length = packet.len() as u16;
        let channel = &self.channels[usize::from(channel_id)];
        let flags = packet.flags();
        let (command_flags, info) =
            if flags.contains(PacketFlags::UNSEQUENCED) && !flags.contains(PacketFlags::RELIABLE) {
                (
                    CommandFlags::UNSEQUENCED,
                    CommandInfo::SendUnsequenced {
                        unsequenced_group: 0,
                        data_length,
                    },
                )
            } else if flags.contains(PacketFlags::RELIABLE)
                || channel.outgoing_unreliable_sequence_number >= 0xFFFF
            {
                (
                    CommandFlags::ACKNOWLEDGE,
                    CommandInfo::SendReliable { data_length },
                )
            } else {
                (
                    CommandFlags::NONE,
                    CommandInfo::SendUnreliable {
                        unreliable_sequence_number: 0,
                        data_length,
                    },
                )
            };

        let command = Command {
            flags: command_flags,
            channel_id,
            reliable_sequence_number: 0,
            info,
        };
        self.queue_outgoing_command(command, Some(packet), 0, data_length);
        Ok(())
    }

    fn send_fragmented(
        &mut self,
        channel_id: u8,
        packet: Packet,
        fragment_length: usize,
    ) -> Result<(), SendError> {
        let fragment_count = packet.len().div_ceil(fragment_length);
        if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
            return Err(SendError::PacketTooLarge);
        }

        let channel = &self.channels[usize::from(channel_id)];
        let unreliable = packet.flags().contains(PacketFlags::UNRELIABLE_FRAGMENT)
            && !packet.flags().contains(PacketFlags::RELIABLE)
            && channel.outgoing_unreliable_sequence_number < 0xFFFF;
        let (flags, start_sequence_number) = if unreliable {
            (
                CommandFlags::NONE,
                channel.outgoing_unreliable_sequence_number.wrapping_add(1),
            )
        } else {
            (
                CommandFlags::ACKNOWLEDGE,
                channel.outgoing_reliable_sequence_number.wrapping_add(1),
            )
        };

        let total_length = packet.len() as u32;
        let mut fragments = Vec::with_capacity(fragment_count);
        let mut fragment_offset = 0usize;
        for fragment_number in 0..fragment_count {
            let length = fragment_length.min(packet.len() - fragment_offset);
            let fragment = squall_proto::command::SendFragment {
                start_sequence_number,
                data_length: length as u16,
                fragment_count: fragment_count as u32,
                fragment_number: fragment_number as u32,
                total_length,
                fragment_offset: fragment_offset as u32,
            };
            let info = if unreliable {
                CommandInfo::SendUnreliableFragment(fragment)
            } else {
                CommandInfo::SendFragment(fragment)
            };
            fragments.push(OutgoingCommand::new(
                Command {
                    flags,
                    channel_id,
                    reliable_sequence_number: 0,
                    info,
                },
                Some(packet.clone()),
                fragment_offset as u32,
                length as u16,
            ));
            fragment_offset += length;
        }

        for fragment in fragments {
            self.setup_outgoing_command(fragment);
        }
        Ok(())
    }

    /// Queues a PING on the control channel.
    pub(crate) fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_outgoing_command(
            Command {
                flags: CommandFlags::ACKNOWLEDGE,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                info: CommandInfo::Ping,
            },
            None,
            0,
            0,
        );
    }

    /// Pops the next fully dispatched message for the application.
    pub(crate) fn receive_dispatched(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;
        let channel_id = command.command.channel_id;
        self.total_waiting_data = self.total_waiting_data.saturating_sub(command.payload.len());
        Some((channel_id, command.into_packet()))
    }

    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand::new(
            command,
            packet,
            fragment_offset,
            fragment_length,
        ));
    }

    /// Assigns sequence numbers and files the command into the right
    /// outgoing queue.
    fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        let size = outgoing.command.size() + usize::from(outgoing.fragment_length);
        self.outgoing_data_total = self.outgoing_data_total.wrapping_add(size as u32);

        if outgoing.command.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[usize::from(outgoing.command.channel_id)];
            if outgoing.command.flags.wants_acknowledge() {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.flags.is_unsequenced() {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.reliable_sequence_number = outgoing.reliable_sequence_number;
        match &mut outgoing.command.info {
            CommandInfo::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandInfo::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        if outgoing.command.flags.wants_acknowledge() {
            self.outgoing_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_unreliable_commands.push_back(outgoing);
        }
    }

    /// Queues an acknowledgement of `command` for the next flush, unless
    /// its sequence number lies in the guard band just outside the receive
    /// window.
    pub(crate) fn queue_acknowledgement(&mut self, command: &Command, sent_time: u16) -> bool {
        if usize::from(command.channel_id) < self.channels.len() {
            let current = self.channels[usize::from(command.channel_id)]
                .incoming_reliable_sequence_number;
            let window = reliable_window(command.reliable_sequence_number, current);
            let current_window = current / RELIABLE_WINDOW_SIZE;
            if window >= current_window + FREE_RELIABLE_WINDOWS - 1
                && window <= current_window + FREE_RELIABLE_WINDOWS
            {
                return false;
            }
        }
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add(Opcode::Acknowledge.size() as u32);
        self.acknowledgements.push_back(Acknowledgement {
            opcode: command.info.opcode(),
            channel_id: command.channel_id,
            reliable_sequence_number: command.reliable_sequence_number,
            sent_time,
        });
        true
    }

    /// Validates a received send-family command against the channel's
    /// windows and sequencing state and, if acceptable, inserts it into
    /// the channel queue at its sorted position.
    ///
    /// `payload` is `None` for a fragment reassembly shell, in which case a
    /// zeroed buffer of `total_length` bytes is reserved up front.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_incoming_command(
        &mut self,
        command: &Command,
        payload: Option<&[u8]>,
        total_length: usize,
        packet_flags: PacketFlags,
        fragment_count: u32,
        maximum_waiting_data: usize,
    ) -> Admission {
        let discard = if fragment_count > 0 {
            Admission::Refused
        } else {
            Admission::Discarded
        };

        if self.state == PeerState::DisconnectLater {
            return discard;
        }

        let opcode = command.info.opcode();
        let channel_index = usize::from(command.channel_id);
        let reliable_sequence_number = command.reliable_sequence_number;
        let mut unreliable_sequence_number = 0u16;

        if opcode != Opcode::SendUnsequenced {
            let current = self.channels[channel_index].incoming_reliable_sequence_number;
            if !window_acceptable(reliable_sequence_number, current) {
                return discard;
            }
        }

        enum Placement {
            Reliable(usize),
            Unreliable(usize),
        }

        let placement = match opcode {
            Opcode::SendFragment | Opcode::SendReliable => {
                let channel = &self.channels[channel_index];
                let current = channel.incoming_reliable_sequence_number;
                if reliable_sequence_number == current {
                    return discard;
                }
                let ahead = reliable_sequence_number >= current;
                let queue = &channel.incoming_reliable_commands;
                let mut insert_index = 0;
                for i in (0..queue.len()).rev() {
                    let existing = &queue[i];
                    if ahead {
                        if existing.reliable_sequence_number < current {
                            continue;
                        }
                    } else if existing.reliable_sequence_number >= current {
                        insert_index = i + 1;
                        break;
                    }
                    if existing.reliable_sequence_number <= reliable_sequence_number {
                        if existing.reliable_sequence_number == reliable_sequence_number {
                            return discard;
                        }
                        insert_index = i + 1;
                        break;
                    }
                }
                Placement::Reliable(insert_index)
            }
            Opcode::SendUnreliable | Opcode::SendUnreliableFragment => {
                let (CommandInfo::SendUnreliable {
                    unreliable_sequence_number: unreliable,
                    ..
                }
                | CommandInfo::SendUnreliableFragment(squall_proto::command::SendFragment {
                    start_sequence_number: unreliable,
                    ..
                })) = &command.info
                else {
                    return Admission::Refused;
                };
                unreliable_sequence_number = *unreliable;

                let channel = &self.channels[channel_index];
                let current = channel.incoming_reliable_sequence_number;
                if reliable_sequence_number == current
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return discard;
                }
                let ahead = reliable_sequence_number >= current;
                let queue = &channel.incoming_unreliable_commands;
                let mut insert_index = 0;
                for i in (0..queue.len()).rev() {
                    let existing = &queue[i];
                    if existing.is_unsequenced() {
                        continue;
                    }
                    if ahead {
                        if existing.reliable_sequence_number < current {
                            continue;
                        }
                    } else if existing.reliable_sequence_number >= current {
                        insert_index = i + 1;
                        break;
                    }
                    if existing.reliable_sequence_number < reliable_sequence_number {
                        insert_index = i + 1;
                        break;
                    }
                    if existing.reliable_sequence_number > reliable_sequence_number {
                        continue;
                    }
                    if existing.unreliable_sequence_number <= unreliable_sequence_number {
                        if existing.unreliable_sequence_number == unreliable_sequence_number {
                            return discard;
                        }
                        insert_index = i + 1;
                        break;
                    }
                }
                Placement::Unreliable(insert_index)
            }
            // unsequenced commands go to the front so a blocked unreliable
            // queue cannot delay them
            Opcode::SendUnsequenced => Placement::Unreliable(0),
            _ => return discard,
        };

        if self.total_waiting_data >= maximum_waiting_data {
            return Admission::Refused;
        }

        let payload_buffer = match payload {
            Some(data) => BytesMut::from(data),
            None => BytesMut::zeroed(total_length),
        };
        self.total_waiting_data += payload_buffer.len();

        let incoming = IncomingCommand {
            command: *command,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: (fragment_count > 0)
                .then(|| bitvec![u32, Lsb0; 0; fragment_count as usize]),
            payload: payload_buffer,
            packet_flags,
        };

        let channel = &mut self.channels[channel_index];
        match placement {
            Placement::Reliable(index) => {
                channel.incoming_reliable_commands.insert(index, incoming);
                Admission::Accepted { index }
            }
            Placement::Unreliable(index) => {
                channel.incoming_unreliable_commands.insert(index, incoming);
                Admission::Accepted { index }
            }
        }
    }

    fn mark_needs_dispatch(&mut self, dispatch_queue: &mut VecDeque<u16>) {
        if !self.needs_dispatch {
            self.needs_dispatch = true;
            dispatch_queue.push_back(self.incoming_peer_id);
        }
    }

    /// Moves the dispatchable prefix of a channel's reliable queue to the
    /// peer's dispatched queue, advancing the channel's reliable sequence
    /// number; a new reliable generation then drains the unreliable queue.
    pub(crate) fn dispatch_incoming_reliable_commands(
        &mut self,
        channel_id: u8,
        dispatch_queue: &mut VecDeque<u16>,
    ) {
        let index = usize::from(channel_id);
        let mut dispatched_any = false;
        loop {
            let channel = &mut self.channels[index];
            let Some(front) = channel.incoming_reliable_commands.front() else {
                break;
            };
            if front.fragments_remaining > 0
                || front.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }
            channel.incoming_reliable_sequence_number = front.reliable_sequence_number;
            if front.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add((front.fragment_count - 1) as u16);
            }
            let command = channel
                .incoming_reliable_commands
                .pop_front()
                .unwrap_or_else(|| unreachable!());
            self.dispatched_commands.push_back(command);
            dispatched_any = true;
        }

        if !dispatched_any {
            return;
        }
        self.channels[index].incoming_unreliable_sequence_number = 0;
        self.mark_needs_dispatch(dispatch_queue);
        if !self.channels[index].incoming_unreliable_commands.is_empty() {
            self.dispatch_incoming_unreliable_commands(channel_id, dispatch_queue);
        }
    }

    /// Walks a channel's unreliable queue: runs of deliverable commands
    /// (current reliable generation, fully assembled, plus any unsequenced
    /// commands among them) move to the dispatched queue; stale
    /// generations are dropped; a future generation still inside the
    /// reliable window stops the walk.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        channel_id: u8,
        dispatch_queue: &mut VecDeque<u16>,
    ) {
        let index = usize::from(channel_id);
        let current = self.channels[index].incoming_reliable_sequence_number;
        let queue = std::mem::take(&mut self.channels[index].incoming_unreliable_commands);
        let mut kept: VecDeque<IncomingCommand> = VecDeque::new();
        let mut run: Vec<IncomingCommand> = Vec::new();
        let mut dispatched_any = false;
        let mut drain = queue.into_iter();

        for command in drain.by_ref() {
            if command.is_unsequenced() {
                run.push(command);
                continue;
            }

            if command.reliable_sequence_number == current {
                if command.fragments_remaining == 0 {
                    self.channels[index].incoming_unreliable_sequence_number =
                        command.unreliable_sequence_number;
                    run.push(command);
                    continue;
                }
                // a half-assembled fragment blocks the commands behind it,
                // but what came before it can go out now
                for ready in run.drain(..) {
                    self.dispatched_commands.push_back(ready);
                    dispatched_any = true;
                }
                kept.push_back(command);
                continue;
            }

            if window_acceptable(command.reliable_sequence_number, current) {
                // future reliable generation: everything from here on waits
                for ready in run.drain(..) {
                    self.dispatched_commands.push_back(ready);
                    dispatched_any = true;
                }
                kept.push_back(command);
                break;
            }

            // stale generation, or wandered outside the window entirely
            for ready in run.drain(..) {
                self.dispatched_commands.push_back(ready);
                dispatched_any = true;
            }
            trace!(
                peer = self.incoming_peer_id,
                channel = channel_id,
                sequence = command.reliable_sequence_number,
                "dropping stale unreliable command"
            );
            self.total_waiting_data = self
                .total_waiting_data
                .saturating_sub(command.payload.len());
        }

        for ready in run.drain(..) {
            self.dispatched_commands.push_back(ready);
            dispatched_any = true;
        }
        for command in drain {
            kept.push_back(command);
        }
        self.channels[index].incoming_unreliable_commands = kept;

        if dispatched_any {
            self.mark_needs_dispatch(dispatch_queue);
        }
    }

    /// Duplicate-rejection check for an unsequenced group; `true` means
    /// the command should be accepted. Jumping to a new window band resets
    /// the window.
    pub(crate) fn admit_unsequenced(&mut self, group: u16) -> bool {
        let index = usize::from(group) % UNSEQUENCED_WINDOW_SIZE as usize;
        let mut extended = u32::from(group);
        if group < self.incoming_unsequenced_group {
            extended += 0x10000;
        }
        if extended
            >= u32::from(self.incoming_unsequenced_group)
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return false;
        }
        let group = extended as u16;
        if group.wrapping_sub(index as u16) != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = group.wrapping_sub(index as u16);
            self.unsequenced_window.fill(false);
        } else if self.unsequenced_window[index] {
            return false;
        }
        true
    }

    /// Records an admitted unsequenced group in the window.
    pub(crate) fn mark_unsequenced(&mut self, group: u16) {
        let index = usize::from(group) % UNSEQUENCED_WINDOW_SIZE as usize;
        self.unsequenced_window.set(index, true);
    }

    /// Adapts the send throttle to a round-trip sample, against the
    /// conditions of the last measurement interval.
    pub(crate) fn throttle(&mut self, round_trip_time: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if round_trip_time < self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if round_trip_time
            > self.last_round_trip_time + 2 * self.last_round_trip_time_variance
        {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }
        0
    }

    /// Settles the reliable command `(reliable_sequence_number,
    /// channel_id)` on acknowledgement, releasing its window slot and
    /// in-transit budget. Returns the command's opcode, or `None` if no
    /// such command is outstanding.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<Opcode> {
        let matches = |command: &OutgoingCommand| {
            command.reliable_sequence_number == reliable_sequence_number
                && command.command.channel_id == channel_id
        };

        let (outgoing, was_sent) = if let Some(i) =
            self.sent_reliable_commands.iter().position(matches)
        {
            (
                self.sent_reliable_commands
                    .remove(i)
                    .unwrap_or_else(|| unreachable!()),
                true,
            )
        } else {
            // acknowledged before we got to (re)transmit it; possible when
            // the remote acked an earlier transmission
            let i = self.outgoing_reliable_commands.iter().position(matches)?;
            if self.outgoing_reliable_commands[i].send_attempts < 1 {
                return None;
            }
            (
                self.outgoing_reliable_commands
                    .remove(i)
                    .unwrap_or_else(|| unreachable!()),
                false,
            )
        };

        if usize::from(channel_id) < self.channels.len() {
            let channel = &mut self.channels[usize::from(channel_id)];
            let window = usize::from(reliable_sequence_number / RELIABLE_WINDOW_SIZE);
            if channel.reliable_windows[window] > 0 {
                channel.reliable_windows[window] -= 1;
                if channel.reliable_windows[window] == 0 {
                    channel.used_reliable_windows &= !(1 << window);
                }
            }
        }

        let opcode = outgoing.opcode();
        if was_sent && outgoing.packet.is_some() {
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(u32::from(outgoing.fragment_length));
        }
        drop(outgoing);

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }
        Some(opcode)
    }

    /// Settles every sent unreliable command; they are never retransmitted.
    pub(crate) fn remove_sent_unreliable_commands(&mut self) {
        while let Some(mut command) = self.sent_unreliable_commands.pop_front() {
            if let Some(packet) = &mut command.packet {
                packet.mark_sent();
            }
        }
    }

    /// Walks the sent-reliable queue for commands whose retransmission
    /// timeout has expired, moving them back to the head of the outgoing
    /// queue with their timeouts doubled. Returns `true` if the peer has
    /// been silent long enough to be declared dead.
    pub(crate) fn check_timeouts(&mut self, service_time: u32) -> bool {
        let mut expired: Vec<OutgoingCommand> = Vec::new();
        let mut i = 0;
        while i < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[i];
            if time_difference(service_time, command.sent_time) < command.round_trip_timeout {
                i += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(command.sent_time, self.earliest_timeout) {
                self.earliest_timeout = command.sent_time;
            }
            if self.earliest_timeout != 0 {
                let silent_for = time_difference(service_time, self.earliest_timeout);
                if silent_for >= self.timeout_maximum
                    || (command.round_trip_timeout >= command.round_trip_timeout_limit
                        && silent_for >= self.timeout_minimum)
                {
                    // put the expired commands back so the caller's reset
                    // releases everything in one place
                    for command in expired.into_iter().rev() {
                        self.outgoing_reliable_commands.push_front(command);
                    }
                    return true;
                }
            }

            let mut command = self
                .sent_reliable_commands
                .remove(i)
                .unwrap_or_else(|| unreachable!());
            if command.packet.is_some() {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(u32::from(command.fragment_length));
            }
            self.packets_lost += 1;
            command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);
            expired.push(command);
        }

        if !expired.is_empty() {
            trace!(
                peer = self.incoming_peer_id,
                count = expired.len(),
                "retrying timed-out reliable commands"
            );
        }
        for command in expired.into_iter().rev() {
            self.outgoing_reliable_commands.push_front(command);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(0, 1400);
        peer.state = PeerState::Connected;
        peer.channels = (0..channels).map(|_| Channel::new()).collect();
        peer
    }

    fn send_command(channel_id: u8, reliable_sequence_number: u16, data: &[u8]) -> Command {
        Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id,
            reliable_sequence_number,
            info: CommandInfo::SendReliable {
                data_length: data.len() as u16,
            },
        }
    }

    #[test]
    fn first_control_reliable_sequence_is_one() {
        let mut peer = connected_peer(1);
        peer.ping();
        assert_eq!(1, peer.outgoing_reliable_commands[0].reliable_sequence_number);
        assert_eq!(0xFF, peer.outgoing_reliable_commands[0].command.channel_id);
    }

    #[test]
    fn send_chooses_command_by_flags() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::reliable(vec![1]), false, 1 << 20).unwrap();
        peer.send(0, Packet::unreliable(vec![2]), false, 1 << 20).unwrap();
        peer.send(0, Packet::unsequenced(vec![3]), false, 1 << 20).unwrap();

        assert_eq!(1, peer.outgoing_reliable_commands.len());
        assert_eq!(2, peer.outgoing_unreliable_commands.len());
        assert_eq!(
            Opcode::SendReliable,
            peer.outgoing_reliable_commands[0].opcode()
        );
        assert_eq!(
            Opcode::SendUnreliable,
            peer.outgoing_unreliable_commands[0].opcode()
        );
        assert_eq!(
            Opcode::SendUnsequenced,
            peer.outgoing_unreliable_commands[1].opcode()
        );
    }

    #[test]
    fn reliable_send_resets_unreliable_counter() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::unreliable(vec![1]), false, 1 << 20).unwrap();
        assert_eq!(1, peer.channels[0].outgoing_unreliable_sequence_number);
        peer.send(0, Packet::reliable(vec![2]), false, 1 << 20).unwrap();
        assert_eq!(0, peer.channels[0].outgoing_unreliable_sequence_number);
        assert_eq!(1, peer.channels[0].outgoing_reliable_sequence_number);
    }

    #[test]
    fn unreliable_upgrades_to_reliable_at_sequence_exhaustion() {
        let mut peer = connected_peer(1);
        peer.channels[0].outgoing_unreliable_sequence_number = 0xFFFF;
        peer.send(0, Packet::unreliable(vec![1]), false, 1 << 20).unwrap();
        assert_eq!(1, peer.outgoing_reliable_commands.len());
        assert_eq!(
            Opcode::SendReliable,
            peer.outgoing_reliable_commands[0].opcode()
        );
    }

    #[test]
    fn send_rejects_bad_arguments() {
        let mut peer = connected_peer(1);
        assert_matches!(
            peer.send(1, Packet::reliable(vec![1]), false, 1 << 20),
            Err(SendError::InvalidChannel)
        );
        assert_matches!(
            peer.send(0, Packet::reliable(vec![0; 64]), false, 63),
            Err(SendError::PacketTooLarge)
        );
        peer.state = PeerState::Disconnected;
        assert_matches!(
            peer.send(0, Packet::reliable(vec![1]), false, 1 << 20),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn fragmentation_threshold_is_exact() {
        let mtu = 1400usize;
        let threshold = mtu
            - squall_proto::header::DatagramHeader::FULL_LEN
            - Opcode::SendFragment.size();

        let mut peer = connected_peer(1);
        peer.send(0, Packet::reliable(vec![0; threshold]), false, 1 << 20).unwrap();
        assert_eq!(1, peer.outgoing_reliable_commands.len());
        assert_eq!(
            Opcode::SendReliable,
            peer.outgoing_reliable_commands[0].opcode()
        );

        let mut peer = connected_peer(1);
        peer.send(0, Packet::reliable(vec![0; threshold + 1]), false, 1 << 20).unwrap();
        assert_eq!(2, peer.outgoing_reliable_commands.len());
        assert_eq!(
            Opcode::SendFragment,
            peer.outgoing_reliable_commands[0].opcode()
        );
        // all fragments share the payload buffer and the start sequence
        let first = &peer.outgoing_reliable_commands[0];
        let second = &peer.outgoing_reliable_commands[1];
        let (CommandInfo::SendFragment(f1), CommandInfo::SendFragment(f2)) =
            (&first.command.info, &second.command.info)
        else {
            panic!("expected fragments");
        };
        assert_eq!(f1.start_sequence_number, f2.start_sequence_number);
        assert_eq!(1, f1.start_sequence_number);
        assert_eq!(threshold + 1, (f1.data_length + f2.data_length) as usize);
    }

    #[test]
    fn incoming_commands_sort_and_deduplicate() {
        let mut peer = connected_peer(1);
        let max = usize::MAX;

        assert_matches!(
            peer.queue_incoming_command(&send_command(0, 2, b"b"), Some(b"b"), 1, PacketFlags::RELIABLE, 0, max),
            Admission::Accepted { .. }
        );
        assert_matches!(
            peer.queue_incoming_command(&send_command(0, 1, b"a"), Some(b"a"), 1, PacketFlags::RELIABLE, 0, max),
            Admission::Accepted { index: 0 }
        );
        assert_matches!(
            peer.queue_incoming_command(&send_command(0, 2, b"b"), Some(b"b"), 1, PacketFlags::RELIABLE, 0, max),
            Admission::Discarded
        );

        let sequences: Vec<u16> = peer.channels[0]
            .incoming_reliable_commands
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(vec![1, 2], sequences);
    }

    #[test]
    fn incoming_rejects_outside_window() {
        let mut peer = connected_peer(1);
        // window 7 relative to a receiver at 0 is outside the free band
        assert_matches!(
            peer.queue_incoming_command(
                &send_command(0, 0x7001, b"x"),
                Some(b"x"),
                1,
                PacketFlags::RELIABLE,
                0,
                usize::MAX
            ),
            Admission::Discarded
        );
    }

    #[test]
    fn flow_control_refuses_when_full() {
        let mut peer = connected_peer(1);
        peer.total_waiting_data = 8;
        assert_matches!(
            peer.queue_incoming_command(&send_command(0, 1, b"x"), Some(b"x"), 1, PacketFlags::RELIABLE, 0, 8),
            Admission::Refused
        );
    }

    #[test]
    fn reliable_dispatch_is_in_order_and_exactly_once() {
        let mut peer = connected_peer(1);
        let mut dispatch_queue = VecDeque::new();
        let max = usize::MAX;

        peer.queue_incoming_command(&send_command(0, 2, b"b"), Some(b"b"), 1, PacketFlags::RELIABLE, 0, max);
        peer.dispatch_incoming_reliable_commands(0, &mut dispatch_queue);
        // sequence 1 still missing
        assert!(peer.dispatched_commands.is_empty());
        assert!(dispatch_queue.is_empty());

        peer.queue_incoming_command(&send_command(0, 1, b"a"), Some(b"a"), 1, PacketFlags::RELIABLE, 0, max);
        peer.dispatch_incoming_reliable_commands(0, &mut dispatch_queue);
        assert_eq!(2, peer.dispatched_commands.len());
        assert_eq!(vec![0], Vec::from(dispatch_queue.clone()));
        assert_eq!(2, peer.channels[0].incoming_reliable_sequence_number);

        let (channel, packet) = peer.receive_dispatched().unwrap();
        assert_eq!(0, channel);
        assert_eq!(b"a", packet.data());
        let (_, packet) = peer.receive_dispatched().unwrap();
        assert_eq!(b"b", packet.data());
        assert_eq!(0, peer.total_waiting_data);
    }

    #[test]
    fn unsequenced_window_rejects_duplicates() {
        let mut peer = connected_peer(1);
        assert!(peer.admit_unsequenced(7));
        peer.mark_unsequenced(7);
        assert!(!peer.admit_unsequenced(7));
        assert!(peer.admit_unsequenced(8));

        // jumping far ahead adopts a new window and forgets the old bits
        let far = 7 + (FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE) as u16;
        assert!(!peer.admit_unsequenced(far));
        let near = 7 + UNSEQUENCED_WINDOW_SIZE as u16;
        assert!(peer.admit_unsequenced(near));
        peer.mark_unsequenced(near);
        assert!(!peer.admit_unsequenced(near));
    }

    #[test]
    fn throttle_tracks_interval_conditions() {
        let mut peer = connected_peer(1);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 16;

        assert_eq!(1, peer.throttle(50));
        assert_eq!(16 + PACKET_THROTTLE_ACCELERATION, peer.packet_throttle);

        assert_eq!(-1, peer.throttle(200));
        assert_eq!(16, peer.packet_throttle);

        // a sample equal to the last interval's time changes nothing
        assert_eq!(0, peer.throttle(100));
        assert_eq!(16, peer.packet_throttle);

        // within the variance band: no change either
        assert_eq!(0, peer.throttle(115));
        assert_eq!(16, peer.packet_throttle);

        // degenerate interval snaps to the limit
        peer.last_round_trip_time = 5;
        peer.last_round_trip_time_variance = 10;
        peer.throttle(1000);
        assert_eq!(peer.packet_throttle_limit, peer.packet_throttle);
    }

    #[test]
    fn remove_sent_reliable_releases_window() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::reliable(vec![1, 2, 3]), false, 1 << 20).unwrap();
        let mut command = peer.outgoing_reliable_commands.pop_front().unwrap();
        command.send_attempts = 1;
        peer.channels[0].reliable_windows[0] = 1;
        peer.channels[0].used_reliable_windows = 1;
        peer.reliable_data_in_transit = 3;
        peer.sent_reliable_commands.push_back(command);

        let opcode = peer.remove_sent_reliable_command(1, 0);
        assert_eq!(Some(Opcode::SendReliable), opcode);
        assert_eq!(0, peer.reliable_data_in_transit);
        assert_eq!(0, peer.channels[0].reliable_windows[0]);
        assert_eq!(0, peer.channels[0].used_reliable_windows);

        assert_eq!(None, peer.remove_sent_reliable_command(1, 0));
    }

    #[test]
    fn timed_out_commands_requeue_in_order() {
        let mut peer = connected_peer(1);
        for seq in 1..=3u16 {
            let mut command = OutgoingCommand::new(send_command(0, seq, b"x"), None, 0, 0);
            command.reliable_sequence_number = seq;
            command.sent_time = 0;
            command.round_trip_timeout = 100;
            command.round_trip_timeout_limit = 100 * TIMEOUT_LIMIT;
            peer.sent_reliable_commands.push_back(command);
        }

        assert!(!peer.check_timeouts(150));
        assert_eq!(0, peer.sent_reliable_commands.len());
        let sequences: Vec<u16> = peer
            .outgoing_reliable_commands
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(vec![1, 2, 3], sequences);
        assert_eq!(3, peer.packets_lost);
        assert_eq!(200, peer.outgoing_reliable_commands[0].round_trip_timeout);
    }

    #[test]
    fn silent_peer_times_out() {
        let mut peer = connected_peer(1);
        let mut command = OutgoingCommand::new(send_command(0, 1, b"x"), None, 0, 0);
        command.reliable_sequence_number = 1;
        command.sent_time = 1000;
        // the doubled timeout has exceeded its limit
        command.round_trip_timeout = 400;
        command.round_trip_timeout_limit = 200;
        peer.sent_reliable_commands.push_back(command);

        // not dead yet: silent for less than the minimum
        assert!(!peer.check_timeouts(1000 + 401));
        let requeued = peer.outgoing_reliable_commands.pop_front().unwrap();
        peer.sent_reliable_commands.push_back(requeued);

        // past the minimum silent interval with the limit exceeded: dead
        assert!(peer.check_timeouts(1000 + TIMEOUT_MINIMUM + 1));
    }
}
