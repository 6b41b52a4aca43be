//! See [`Host`].

use std::{collections::VecDeque, io, net::SocketAddr};

use squall_proto::{
    checksum::{Checksum, Crc32},
    command::{Command, CommandFlags, CommandInfo, Connect},
    compress::{Compressor, RangeCoder},
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
    MINIMUM_CHANNEL_COUNT, MINIMUM_MTU, MINIMUM_WINDOW_SIZE,
};
use tracing::debug;

use crate::{
    channel::Channel,
    event::Event,
    packet::Packet,
    peer::{Peer, PeerId, PeerState, SendError, WINDOW_SIZE_SCALE},
    socket::{Socket, UdpTransport},
    time::{Clock, MonotonicClock},
};

/// How often the cross-peer bandwidth throttle recomputes, in milliseconds.
pub(crate) const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

const DEFAULT_MTU: u32 = 1400;
const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Verdict of a receive [intercept](Host::set_intercept) on one raw
/// datagram.
#[derive(Debug)]
pub enum Intercept {
    /// Hand the datagram to the protocol as usual.
    Pass,
    /// Swallow the datagram.
    Consume,
    /// Swallow the datagram and surface this event instead.
    Event(Event),
    /// Abort the service call with an error.
    Error,
}

/// Raw-datagram filter installed with [`Host::set_intercept`].
pub type InterceptFn = Box<dyn FnMut(SocketAddr, &[u8]) -> Intercept>;

/// Construction parameters for a [`Host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of peer slots; bounds how many concurrent connections the
    /// host can hold.
    pub peer_count: usize,
    /// Most channels allowed per connection, clamped to `[1, 255]`;
    /// 0 means 255.
    pub channel_limit: usize,
    /// Incoming bandwidth in bytes/second, 0 for unlimited.
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes/second, 0 for unlimited.
    pub outgoing_bandwidth: u32,
    /// Datagram size assumed until a connection negotiates its own,
    /// clamped to `[576, 4096]`.
    pub mtu: u32,
    /// Largest message payload accepted for sending or reassembly.
    pub maximum_packet_size: usize,
    /// Cap on buffered incoming payload bytes per peer; a peer exceeding
    /// it is treated as misbehaving.
    pub maximum_waiting_data: usize,
    /// Most established connections accepted from one IP address. The
    /// default effectively disables the cap.
    pub duplicate_peers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
        }
    }
}

/// Invalid [`HostConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostConfigError {
    /// `peer_count` was 0 or above [`MAXIMUM_PEER_ID`].
    #[error("peer count out of range")]
    PeerCount,
}

/// Failure to initiate a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Every peer slot is occupied.
    #[error("no free peer slot")]
    NoFreeSlots,
}

/// One endpoint of the transport: a socket, an array of peer slots, and
/// the service loop that moves messages between them.
///
/// A host is single-threaded and cooperative: nothing happens between
/// calls to [`service`](Self::service) or [`flush`](Self::flush).
pub struct Host {
    pub(crate) socket: Box<dyn Socket>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) channel_limit: usize,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) mtu: u32,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
    pub(crate) duplicate_peers: usize,
    pub(crate) random_seed: u32,
    pub(crate) service_time: u32,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,
    pub(crate) dispatch_queue: VecDeque<u16>,
    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) checksum: Option<Box<dyn Checksum>>,
    pub(crate) intercept: Option<InterceptFn>,
    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peers", &self.peers.len())
            .field("connected_peers", &self.connected_peers)
            .field("channel_limit", &self.channel_limit)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Creates a host over an already-constructed socket and clock.
    ///
    /// Most applications will use [`Host::bind`]; this constructor exists
    /// for custom transports and deterministic tests.
    pub fn new(
        socket: Box<dyn Socket>,
        mut clock: Box<dyn Clock>,
        config: HostConfig,
    ) -> Result<Self, HostConfigError> {
        if config.peer_count == 0 || config.peer_count > MAXIMUM_PEER_ID as usize {
            return Err(HostConfigError::PeerCount);
        }
        let mtu = config.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        let channel_limit = if config.channel_limit == 0 {
            MAXIMUM_CHANNEL_COUNT
        } else {
            config
                .channel_limit
                .clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT)
        };
        let random_seed = clock
            .now()
            .wrapping_mul(0x9E37_79B9)
            .wrapping_add(config.peer_count as u32);
        Ok(Self {
            socket,
            clock,
            peers: (0..config.peer_count)
                .map(|index| Peer::new(index as u16, mtu))
                .collect(),
            channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            mtu,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            duplicate_peers: config.duplicate_peers.min(MAXIMUM_PEER_ID as usize),
            random_seed,
            service_time: 0,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            dispatch_queue: VecDeque::new(),
            compressor: None,
            checksum: None,
            intercept: None,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    /// Binds a UDP socket on `address` and creates a host over it.
    pub fn bind(address: SocketAddr, config: HostConfig) -> io::Result<Self> {
        let socket = UdpTransport::bind(address)?;
        Self::new(
            Box::new(socket),
            Box::new(MonotonicClock::new()),
            config,
        )
        .map_err(io::Error::other)
    }

    /// Local socket address, if the transport has one.
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.socket.local_address()
    }

    /// The peer in slot `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from a different host with more slots.
    #[must_use]
    pub fn peer(&self, id: PeerId) -> &Peer {
        &self.peers[id.index()]
    }

    /// Mutable access to the peer in slot `id`, for reconfiguration.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from a different host with more slots.
    #[must_use]
    pub fn peer_mut(&mut self, id: PeerId) -> &mut Peer {
        &mut self.peers[id.index()]
    }

    /// Iterates over every peer slot with its ID.
    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers
            .iter()
            .enumerate()
            .map(|(index, peer)| (PeerId(index as u16), peer))
    }

    /// Number of fully connected (or draining) peers.
    #[must_use]
    pub const fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    /// Total bytes handed to the socket since creation.
    #[must_use]
    pub const fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    /// Total datagrams handed to the socket since creation.
    #[must_use]
    pub const fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    /// Total bytes received from the socket since creation.
    #[must_use]
    pub const fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    /// Total datagrams received from the socket since creation.
    #[must_use]
    pub const fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    /// Most channels allowed per connection.
    #[must_use]
    pub const fn channel_limit(&self) -> usize {
        self.channel_limit
    }

    /// Changes the channel cap for connections accepted from now on;
    /// 0 means the maximum.
    pub fn set_channel_limit(&mut self, limit: usize) {
        self.channel_limit = if limit == 0 {
            MAXIMUM_CHANNEL_COUNT
        } else {
            limit.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT)
        };
    }

    /// Changes the host bandwidth limits in bytes/second (0 = unlimited)
    /// and schedules renegotiation with every connected peer.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self.recalculate_bandwidth_limits = true;
    }

    /// Installs (or removes) the per-datagram compressor.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Installs the default range-coder compressor.
    pub fn compress_with_range_coder(&mut self) {
        self.compressor = Some(Box::new(RangeCoder::new()));
    }

    /// Installs (or removes) the per-datagram checksum.
    pub fn set_checksum(&mut self, checksum: Option<Box<dyn Checksum>>) {
        self.checksum = checksum;
    }

    /// Installs the default CRC-32 checksum.
    pub fn checksum_with_crc32(&mut self) {
        self.checksum = Some(Box::new(Crc32));
    }

    /// Installs (or removes) a raw-datagram receive filter, called before
    /// any protocol processing.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Initiates a connection to `address` with `channel_count` channels,
    /// carrying `data` to the remote's connect event.
    ///
    /// The connection is not usable until a [`Event::Connect`] for the
    /// returned peer surfaces from [`service`](Self::service).
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, ConnectError> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);
        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(ConnectError::NoFreeSlots)?;

        self.random_seed = self
            .random_seed
            .wrapping_mul(0x0019_660D)
            .wrapping_add(0x3C6E_F35F);
        let connect_id = self.random_seed;

        let window_size = if self.outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            ((self.outgoing_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
        };

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = connect_id;
        peer.window_size = window_size;

        let command = Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            info: CommandInfo::Connect(Connect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: self.incoming_bandwidth,
                outgoing_bandwidth: self.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
                data,
            }),
        };
        peer.queue_outgoing_command(command, None, 0, 0);

        debug!(peer = index, %address, "connecting");
        Ok(PeerId(index as u16))
    }

    /// Queues `packet` for delivery to `peer` on `channel_id`.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<(), SendError> {
        let checksum_installed = self.checksum.is_some();
        let maximum_packet_size = self.maximum_packet_size;
        self.peers[peer.index()].send(channel_id, packet, checksum_installed, maximum_packet_size)
    }

    /// Pops the next fully reassembled message from `peer` without
    /// running the service loop, returning its channel and payload.
    pub fn receive(&mut self, peer: PeerId) -> Option<(u8, Packet)> {
        self.peers[peer.index()].receive_dispatched()
    }

    /// Queues `packet` to every connected peer on `channel_id`.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        let checksum_installed = self.checksum.is_some();
        let maximum_packet_size = self.maximum_packet_size;
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            let _ = peer.send(
                channel_id,
                packet.clone(),
                checksum_installed,
                maximum_packet_size,
            );
        }
    }

    /// Sends a ping to `peer`, which doubles as a liveness probe.
    pub fn ping(&mut self, peer: PeerId) {
        self.peers[peer.index()].ping();
    }

    /// Sets the keepalive interval of `peer` in milliseconds.
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) {
        self.peers[peer.index()].set_ping_interval(interval);
    }

    /// Sets the timeout parameters of `peer`; zeros restore defaults.
    pub fn set_timeout(&mut self, peer: PeerId, limit: u32, minimum: u32, maximum: u32) {
        self.peers[peer.index()].set_timeout(limit, minimum, maximum);
    }

    /// Reconfigures the throttle of `peer` and tells the remote end to
    /// measure against the same interval.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        let peer = &mut self.peers[peer.index()];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;
        peer.queue_outgoing_command(
            Command {
                flags: CommandFlags::ACKNOWLEDGE,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                info: CommandInfo::ThrottleConfigure {
                    packet_throttle_interval: interval,
                    packet_throttle_acceleration: acceleration,
                    packet_throttle_deceleration: deceleration,
                },
            },
            None,
            0,
            0,
        );
    }

    /// Requests a graceful disconnect: queued traffic is abandoned, a
    /// DISCONNECT is sent, and an [`Event::Disconnect`] surfaces once the
    /// remote acknowledges it.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        let index = peer.index();
        if matches!(
            self.peers[index].state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }
        self.reset_peer_queues(index);

        let was_established = matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        );
        let flags = if was_established {
            CommandFlags::ACKNOWLEDGE
        } else {
            CommandFlags::NONE
        };
        self.peers[index].queue_outgoing_command(
            Command {
                flags,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
                info: CommandInfo::Disconnect { data },
            },
            None,
            0,
            0,
        );

        if was_established {
            self.on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            let _ = self.flush();
            self.reset_peer_slot(index);
        }
    }

    /// Requests a disconnect once every queued outgoing command has been
    /// delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = peer.index();
        if matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) && self.peers[index].has_outgoing_commands()
        {
            self.change_state(index, PeerState::DisconnectLater);
            self.peers[index].event_data = data;
        } else {
            self.disconnect(peer, data);
        }
    }

    /// Disconnects immediately: one unsequenced DISCONNECT is flushed out
    /// and the slot is reset. The remote learns of the disconnect only if
    /// that datagram arrives; no local event is generated.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = peer.index();
        if self.peers[index].state == PeerState::Disconnected {
            return;
        }
        if !matches!(
            self.peers[index].state,
            PeerState::Zombie | PeerState::Disconnecting
        ) {
            self.reset_peer_queues(index);
            self.peers[index].queue_outgoing_command(
                Command {
                    flags: CommandFlags::UNSEQUENCED,
                    channel_id: 0xFF,
                    reliable_sequence_number: 0,
                    info: CommandInfo::Disconnect { data },
                },
                None,
                0,
                0,
            );
            let _ = self.flush();
        }
        self.reset_peer_slot(index);
    }

    /// Forcibly resets the slot with no notification to the remote.
    pub fn reset_peer(&mut self, peer: PeerId) {
        self.reset_peer_slot(peer.index());
    }

    pub(crate) fn next_connect_window_size(&self, peer_incoming_bandwidth: u32) -> u32 {
        if self.outgoing_bandwidth == 0 && peer_incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if self.outgoing_bandwidth == 0 || peer_incoming_bandwidth == 0 {
            ((self.outgoing_bandwidth.max(peer_incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
        } else {
            ((self.outgoing_bandwidth.min(peer_incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
        }
    }

    pub(crate) fn on_connect(&mut self, index: usize) {
        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    pub(crate) fn on_disconnect(&mut self, index: usize) {
        if matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers = self.bandwidth_limited_peers.saturating_sub(1);
            }
            self.connected_peers = self.connected_peers.saturating_sub(1);
        }
    }

    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        if matches!(state, PeerState::Connected | PeerState::DisconnectLater) {
            self.on_connect(index);
        } else {
            self.on_disconnect(index);
        }
        self.peers[index].state = state;
    }

    /// Changes state and queues the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        if !self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = true;
            self.dispatch_queue.push_back(index as u16);
        }
    }

    /// Empties the peer's queues and pulls it out of the dispatch queue.
    pub(crate) fn reset_peer_queues(&mut self, index: usize) {
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|&queued| usize::from(queued) != index);
            self.peers[index].needs_dispatch = false;
        }
        self.peers[index].reset_queues();
    }

    /// Fully resets the slot, keeping the connected-peer counters honest.
    pub(crate) fn reset_peer_slot(&mut self, index: usize) {
        self.on_disconnect(index);
        self.reset_peer_queues(index);
        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }

    pub(crate) fn notify_connect(&mut self, index: usize, event: Option<&mut Option<Event>>) {
        self.recalculate_bandwidth_limits = true;
        match event {
            Some(slot) => {
                self.change_state(index, PeerState::Connected);
                *slot = Some(Event::Connect {
                    peer: PeerId(index as u16),
                    data: self.peers[index].event_data,
                });
            }
            None => {
                let pending = if self.peers[index].state == PeerState::Connecting {
                    PeerState::ConnectionSucceeded
                } else {
                    PeerState::ConnectionPending
                };
                self.dispatch_state(index, pending);
            }
        }
    }

    pub(crate) fn notify_disconnect(&mut self, index: usize, event: Option<&mut Option<Event>>) {
        let state = self.peers[index].state;
        // a peer that got as far as the pending states was counted into
        // the bandwidth plan
        if matches!(
            state,
            PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
                | PeerState::Connected
                | PeerState::DisconnectLater
                | PeerState::Disconnecting
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            self.recalculate_bandwidth_limits = true;
        }

        if matches!(
            state,
            PeerState::Disconnected | PeerState::AcknowledgingConnect | PeerState::ConnectionPending
        ) {
            self.reset_peer_slot(index);
        } else if let Some(slot) = event {
            *slot = Some(Event::Disconnect {
                peer: PeerId(index as u16),
                data: 0,
            });
            self.reset_peer_slot(index);
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Redistributes the host's bandwidth budget across connected peers:
    /// each peer's throttle limit becomes its pro-rata share of the
    /// outgoing budget (bandwidth-limited peers are granted their own cap
    /// first, then the rest share what remains), and changed incoming
    /// limits are advertised with BANDWIDTH_LIMIT commands.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.clock.now();
        let elapsed = crate::time::time_difference(time_current, self.bandwidth_throttle_epoch);
        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        const SCALE: u64 = crate::peer::PACKET_THROTTLE_SCALE as u64;
        let connected =
            |peer: &Peer| matches!(peer.state, PeerState::Connected | PeerState::DisconnectLater);

        let mut data_total: u64 = u64::MAX;
        let mut bandwidth: u64 = u64::MAX;
        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = u64::from(self.outgoing_bandwidth) * u64::from(elapsed) / 1000;
            for peer in self.peers.iter().filter(|peer| connected(peer)) {
                data_total += u64::from(peer.outgoing_data_total);
            }
        }

        let mut needs_adjustment = self.bandwidth_limited_peers > 0;
        let mut throttle;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            throttle = if data_total <= bandwidth {
                SCALE
            } else {
                bandwidth * SCALE / data_total
            };
            for peer in &mut self.peers {
                if !connected(peer)
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                let peer_bandwidth = u64::from(peer.incoming_bandwidth) * u64::from(elapsed) / 1000;
                if throttle * u64::from(peer.outgoing_data_total) / SCALE <= peer_bandwidth {
                    continue;
                }
                peer.packet_throttle_limit = ((peer_bandwidth * SCALE)
                    / u64::from(peer.outgoing_data_total))
                    .max(1) as u32;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                SCALE
            } else {
                bandwidth * SCALE / data_total
            };
            for peer in &mut self.peers {
                if !connected(peer) || peer.outgoing_bandwidth_throttle_epoch == time_current {
                    continue;
                }
                peer.packet_throttle_limit = throttle as u32;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;
            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut bandwidth_limit = 0;
            let mut needs_adjustment = true;
            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;
                    for peer in &mut self.peers {
                        if !connected(peer)
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }
                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }
            let outgoing_bandwidth = self.outgoing_bandwidth;
            for peer in &mut self.peers {
                if !connected(peer) {
                    continue;
                }
                let incoming = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                peer.queue_outgoing_command(
                    Command {
                        flags: CommandFlags::ACKNOWLEDGE,
                        channel_id: 0xFF,
                        reliable_sequence_number: 0,
                        info: CommandInfo::BandwidthLimit {
                            incoming_bandwidth: incoming,
                            outgoing_bandwidth,
                        },
                    },
                    None,
                    0,
                    0,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        socket::WaitCondition,
        time::ManualClock,
    };
    use std::time::Duration;

    struct NullSocket;

    impl Socket for NullSocket {
        fn send(&mut self, _address: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
            Ok(buffers.iter().map(|buffer| buffer.len()).sum())
        }

        fn recv(&mut self, _buffer: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
            Ok(None)
        }

        fn wait(&mut self, condition: &mut WaitCondition, _timeout: Duration) -> io::Result<()> {
            *condition = WaitCondition::NONE;
            Ok(())
        }
    }

    fn host(config: HostConfig) -> Host {
        Host::new(
            Box::new(NullSocket),
            Box::new(ManualClock::new(0)),
            config,
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_and_oversized_peer_counts() {
        let result = Host::new(
            Box::new(NullSocket),
            Box::new(ManualClock::new(0)),
            HostConfig {
                peer_count: 0,
                ..HostConfig::default()
            },
        );
        assert!(result.is_err());

        let result = Host::new(
            Box::new(NullSocket),
            Box::new(ManualClock::new(0)),
            HostConfig {
                peer_count: MAXIMUM_PEER_ID as usize + 1,
                ..HostConfig::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn connect_queues_connect_command() {
        let mut host = host(HostConfig::default());
        let address = "127.0.0.1:9999".parse().unwrap();
        let peer = host.connect(address, 2, 42).unwrap();

        let state = host.peer(peer).state();
        assert_eq!(PeerState::Connecting, state);
        assert_eq!(2, host.peer(peer).channel_count());

        let queued = &host.peers[peer.index()].outgoing_reliable_commands[0];
        // the connect command always carries control-channel sequence 1
        assert_eq!(1, queued.reliable_sequence_number);
        let CommandInfo::Connect(connect) = &queued.command.info else {
            panic!("expected connect");
        };
        assert_eq!(42, connect.data);
        assert_eq!(2, connect.channel_count);
        assert_ne!(0, connect.connect_id);
    }

    #[test]
    fn connect_exhausts_slots() {
        let mut host = host(HostConfig {
            peer_count: 1,
            ..HostConfig::default()
        });
        let address = "127.0.0.1:9999".parse().unwrap();
        host.connect(address, 1, 0).unwrap();
        assert!(matches!(
            host.connect(address, 1, 0),
            Err(ConnectError::NoFreeSlots)
        ));
    }

    #[test]
    fn channel_limit_is_clamped() {
        let mut host = host(HostConfig::default());
        host.set_channel_limit(0);
        assert_eq!(MAXIMUM_CHANNEL_COUNT, host.channel_limit());
        host.set_channel_limit(1000);
        assert_eq!(MAXIMUM_CHANNEL_COUNT, host.channel_limit());
        host.set_channel_limit(7);
        assert_eq!(7, host.channel_limit());
    }

    #[test]
    fn counters_follow_state_changes() {
        let mut host = host(HostConfig::default());
        let address = "127.0.0.1:9999".parse().unwrap();
        let peer = host.connect(address, 1, 0).unwrap();
        assert_eq!(0, host.connected_peers());

        host.change_state(peer.index(), PeerState::Connected);
        assert_eq!(1, host.connected_peers());
        // idempotent once connected
        host.change_state(peer.index(), PeerState::DisconnectLater);
        assert_eq!(1, host.connected_peers());

        host.reset_peer_slot(peer.index());
        assert_eq!(0, host.connected_peers());
        assert_eq!(PeerState::Disconnected, host.peer(peer).state());
    }
}
