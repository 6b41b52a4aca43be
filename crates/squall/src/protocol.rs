//! The service loop: command packing, datagram I/O, and the per-opcode
//! receive handlers.
//!
//! [`Host::service`] drives everything: it snapshots the service clock,
//! runs the cross-peer bandwidth throttle, sends pending commands across
//! all peers, receives and validates datagrams, and dispatches at most one
//! application event per call. [`Host::flush`] reuses the send half with
//! timeout checking disabled.

use std::{io, net::SocketAddr, time::Duration};

use bytes::BytesMut;
use octs::Write;
use squall_proto::{
    command::{Command, CommandFlags, CommandInfo, Connect, Opcode, SendFragment, VerifyConnect},
    header::DatagramHeader,
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PACKET_COMMANDS,
    MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
    MINIMUM_WINDOW_SIZE,
};
use tracing::{debug, trace, warn};

use crate::{
    channel::{window_acceptable, Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE},
    event::Event,
    host::{Host, Intercept, BANDWIDTH_THROTTLE_INTERVAL},
    packet::PacketFlags,
    peer::{
        Admission, PeerId, PeerState, PACKET_LOSS_INTERVAL, PACKET_LOSS_SCALE,
        PACKET_THROTTLE_COUNTER, PACKET_THROTTLE_SCALE, WINDOW_SIZE_SCALE,
    },
    socket::WaitCondition,
    time::{time_difference, time_greater_equal, time_less},
};

/// Receive scratch size; no datagram the protocol emits exceeds the
/// maximum MTU.
const RECEIVE_BUFFER_SIZE: usize = MAXIMUM_MTU as usize;
/// Datagrams drained from the socket per receive pass.
const RECEIVE_BUDGET: usize = 256;

struct CommandError;

type HandleResult = Result<(), CommandError>;

impl Host {
    /// Runs one service cycle, waiting up to `timeout` milliseconds for
    /// something to happen.
    ///
    /// Returns the first event that surfaces, or `None` once the timeout
    /// expires with nothing to report. Socket failures are returned as
    /// errors; the host remains usable.
    pub fn service(&mut self, timeout: u32) -> io::Result<Option<Event>> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.service_time = self.clock.now();
        let deadline = self.service_time.wrapping_add(timeout);

        loop {
            if time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if let Some(event) = self.send_outgoing_commands(true)? {
                return Ok(Some(event));
            }
            if let Some(event) = self.receive_incoming_packets()? {
                return Ok(Some(event));
            }
            if let Some(event) = self.send_outgoing_commands(true)? {
                return Ok(Some(event));
            }
            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            let mut condition;
            loop {
                self.service_time = self.clock.now();
                if time_greater_equal(self.service_time, deadline) {
                    return Ok(None);
                }
                condition = WaitCondition::RECEIVE.with(WaitCondition::INTERRUPT);
                let remaining = time_difference(deadline, self.service_time);
                self.socket
                    .wait(&mut condition, Duration::from_millis(u64::from(remaining)))?;
                if !condition.contains(WaitCondition::INTERRUPT) {
                    break;
                }
            }

            self.service_time = self.clock.now();
            if !condition.contains(WaitCondition::RECEIVE) {
                return Ok(None);
            }
        }
    }

    /// Sends every queued command that fits on the wire right now,
    /// without waiting and without running timeout checks.
    pub fn flush(&mut self) -> io::Result<()> {
        self.service_time = self.clock.now();
        self.send_outgoing_commands(false)?;
        Ok(())
    }

    /// Dequeues one pending event without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(queued) = self.dispatch_queue.pop_front() {
            let index = usize::from(queued);
            self.peers[index].needs_dispatch = false;
            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);
                    return Some(Event::Connect {
                        peer: PeerId(queued),
                        data: self.peers[index].event_data,
                    });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    self.reset_peer_slot(index);
                    return Some(Event::Disconnect {
                        peer: PeerId(queued),
                        data,
                    });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = self.peers[index].receive_dispatched() else {
                        continue;
                    };
                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.peers[index].needs_dispatch = true;
                        self.dispatch_queue.push_back(queued);
                    }
                    return Some(Event::Receive {
                        peer: PeerId(queued),
                        channel_id,
                        packet,
                    });
                }
                _ => {}
            }
        }
        None
    }

    // Send pass ----------------------------------------------------------

    fn send_outgoing_commands(&mut self, check_for_timeouts: bool) -> io::Result<Option<Event>> {
        let mut continue_sending = true;
        while continue_sending {
            continue_sending = false;
            for index in 0..self.peers.len() {
                if matches!(
                    self.peers[index].state,
                    PeerState::Disconnected | PeerState::Zombie
                ) {
                    continue;
                }

                let checksum_len = if self.checksum.is_some() { 4 } else { 0 };
                let mut packet_size = DatagramHeader::FULL_LEN + checksum_len;
                let mut block = BytesMut::new();
                let mut command_count = 0usize;
                let mut sent_time_needed = false;

                if !self.peers[index].acknowledgements.is_empty() {
                    self.pack_acknowledgements(
                        index,
                        &mut block,
                        &mut packet_size,
                        &mut command_count,
                        &mut continue_sending,
                    );
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.peers[index].check_timeouts(self.service_time)
                {
                    debug!(peer = index, "peer timed out");
                    let mut event = None;
                    self.notify_disconnect(index, Some(&mut event));
                    if event.is_some() {
                        return Ok(event);
                    }
                    continue;
                }

                let can_ping = if self.peers[index].outgoing_reliable_commands.is_empty() {
                    true
                } else {
                    self.pack_reliable_commands(
                        index,
                        &mut block,
                        &mut packet_size,
                        &mut command_count,
                        &mut sent_time_needed,
                        &mut continue_sending,
                    )
                };

                if can_ping
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && time_difference(self.service_time, self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && self.peers[index].mtu as usize - packet_size >= Opcode::Ping.size()
                {
                    self.peers[index].ping();
                    self.pack_reliable_commands(
                        index,
                        &mut block,
                        &mut packet_size,
                        &mut command_count,
                        &mut sent_time_needed,
                        &mut continue_sending,
                    );
                }

                if !self.peers[index].outgoing_unreliable_commands.is_empty() {
                    self.pack_unreliable_commands(
                        index,
                        &mut block,
                        &mut packet_size,
                        &mut command_count,
                        &mut continue_sending,
                    );
                }

                if command_count == 0 {
                    continue;
                }

                self.update_packet_loss(index);
                self.transmit(index, &block, sent_time_needed)?;
            }
        }
        Ok(None)
    }

    fn pack_acknowledgements(
        &mut self,
        index: usize,
        block: &mut BytesMut,
        packet_size: &mut usize,
        command_count: &mut usize,
        continue_sending: &mut bool,
    ) {
        let mut zombie = false;
        {
            let peer = &mut self.peers[index];
            let mtu = peer.mtu as usize;
            while let Some(acknowledgement) = peer.acknowledgements.front() {
                if *command_count >= MAXIMUM_PACKET_COMMANDS
                    || mtu - *packet_size < Opcode::Acknowledge.size()
                {
                    *continue_sending = true;
                    break;
                }
                let acknowledgement = *acknowledgement;
                peer.acknowledgements.pop_front();

                let command = Command {
                    flags: CommandFlags::NONE,
                    channel_id: acknowledgement.channel_id,
                    reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    info: CommandInfo::Acknowledge {
                        received_reliable_sequence_number: acknowledgement
                            .reliable_sequence_number,
                        received_sent_time: acknowledgement.sent_time,
                    },
                };
                block
                    .write(&command)
                    .expect("writing to a growable buffer cannot fail");
                *packet_size += command.size();
                *command_count += 1;

                if acknowledgement.opcode == Opcode::Disconnect {
                    zombie = true;
                }
            }
        }
        if zombie {
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Packs as many outgoing reliable commands as the window, throttle
    /// and datagram space allow. Returns whether a ping would be the only
    /// way to elicit an acknowledgement.
    fn pack_reliable_commands(
        &mut self,
        index: usize,
        block: &mut BytesMut,
        packet_size: &mut usize,
        command_count: &mut usize,
        sent_time_needed: &mut bool,
        continue_sending: &mut bool,
    ) -> bool {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        let mtu = peer.mtu as usize;
        let mut can_ping = true;
        let mut window_wrap = false;
        let mut window_exceeded = false;
        let mut position = 0;

        while position < peer.outgoing_reliable_commands.len() {
            {
                let command = &peer.outgoing_reliable_commands[position];
                let channel_index = usize::from(command.command.channel_id);
                let reliable_window = command.reliable_sequence_number / RELIABLE_WINDOW_SIZE;

                if let Some(channel) = peer.channels.get(channel_index) {
                    if !window_wrap
                        && command.send_attempts < 1
                        && command.reliable_sequence_number % RELIABLE_WINDOW_SIZE == 0
                    {
                        // sending the first command of a fresh window must
                        // not wrap into windows the receiver still has in
                        // flight
                        let free_mask = u32::from(FREE_WINDOW_MASK) << reliable_window
                            | u32::from(FREE_WINDOW_MASK) >> (RELIABLE_WINDOWS - reliable_window);
                        if channel.reliable_windows[usize::from(
                            (reliable_window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS,
                        )] >= RELIABLE_WINDOW_SIZE
                            || u32::from(channel.used_reliable_windows) & free_mask != 0
                        {
                            window_wrap = true;
                        }
                    }
                    if window_wrap {
                        position += 1;
                        continue;
                    }
                }

                if command.packet.is_some() {
                    if !window_exceeded {
                        let window_size =
                            (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;
                        if peer.reliable_data_in_transit + u32::from(command.fragment_length)
                            > window_size.max(peer.mtu)
                        {
                            window_exceeded = true;
                        }
                    }
                    if window_exceeded {
                        position += 1;
                        continue;
                    }
                }

                can_ping = false;
                let command_size = command.command.size();
                if *command_count >= MAXIMUM_PACKET_COMMANDS
                    || mtu - *packet_size < command_size
                    || (command.packet.is_some()
                        && mtu - *packet_size
                            < command_size + usize::from(command.fragment_length))
                {
                    *continue_sending = true;
                    break;
                }
            }

            let mut command = peer
                .outgoing_reliable_commands
                .remove(position)
                .unwrap_or_else(|| unreachable!());

            let channel_index = usize::from(command.command.channel_id);
            if channel_index < peer.channels.len() && command.send_attempts < 1 {
                let window = usize::from(command.reliable_sequence_number / RELIABLE_WINDOW_SIZE);
                peer.channels[channel_index].used_reliable_windows |= 1 << window;
                peer.channels[channel_index].reliable_windows[window] += 1;
            }

            command.send_attempts += 1;
            if command.round_trip_timeout == 0 {
                command.round_trip_timeout =
                    peer.round_trip_time + 4 * peer.round_trip_time_variance;
                command.round_trip_timeout_limit = peer
                    .timeout_limit
                    .saturating_mul(command.round_trip_timeout);
            }
            if peer.sent_reliable_commands.is_empty() {
                peer.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
            }
            command.sent_time = service_time;
            *sent_time_needed = true;

            block
                .write(&command.command)
                .expect("writing to a growable buffer cannot fail");
            *packet_size += command.command.size();
            *command_count += 1;

            if let Some(payload) = command.payload() {
                block.extend_from_slice(&payload);
                *packet_size += payload.len();
                peer.reliable_data_in_transit += payload.len() as u32;
            }

            peer.packets_sent += 1;
            peer.sent_reliable_commands.push_back(command);
        }

        can_ping
    }

    fn pack_unreliable_commands(
        &mut self,
        index: usize,
        block: &mut BytesMut,
        packet_size: &mut usize,
        command_count: &mut usize,
        continue_sending: &mut bool,
    ) {
        let peer = &mut self.peers[index];
        let mtu = peer.mtu as usize;

        while let Some(front) = peer.outgoing_unreliable_commands.front() {
            let command_size = front.command.size();
            if *command_count >= MAXIMUM_PACKET_COMMANDS
                || mtu - *packet_size < command_size
                || (front.packet.is_some()
                    && mtu - *packet_size < command_size + usize::from(front.fragment_length))
            {
                *continue_sending = true;
                break;
            }

            if front.packet.is_some() && front.fragment_offset == 0 {
                peer.packet_throttle_counter += PACKET_THROTTLE_COUNTER;
                peer.packet_throttle_counter %= PACKET_THROTTLE_SCALE;
                if peer.packet_throttle_counter > peer.packet_throttle {
                    // drop this message and every remaining command of it
                    let reliable = front.reliable_sequence_number;
                    let unreliable = front.unreliable_sequence_number;
                    while let Some(next) = peer.outgoing_unreliable_commands.front() {
                        if next.reliable_sequence_number != reliable
                            || next.unreliable_sequence_number != unreliable
                        {
                            break;
                        }
                        peer.outgoing_unreliable_commands.pop_front();
                    }
                    continue;
                }
            }

            let command = peer
                .outgoing_unreliable_commands
                .pop_front()
                .unwrap_or_else(|| unreachable!());
            block
                .write(&command.command)
                .expect("writing to a growable buffer cannot fail");
            *packet_size += command_size;
            *command_count += 1;

            if let Some(payload) = command.payload() {
                block.extend_from_slice(&payload);
                *packet_size += payload.len();
                peer.sent_unreliable_commands.push_back(command);
            }
        }
    }

    fn update_packet_loss(&mut self, index: usize) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = service_time;
            return;
        }
        if time_difference(service_time, peer.packet_loss_epoch) < PACKET_LOSS_INTERVAL
            || peer.packets_sent == 0
        {
            return;
        }

        let packet_loss = peer.packets_lost * PACKET_LOSS_SCALE / peer.packets_sent;
        peer.packet_loss_variance -= peer.packet_loss_variance / 4;
        if packet_loss >= peer.packet_loss {
            peer.packet_loss += (packet_loss - peer.packet_loss) / 8;
            peer.packet_loss_variance += (packet_loss - peer.packet_loss) / 4;
        } else {
            peer.packet_loss -= (peer.packet_loss - packet_loss) / 8;
            peer.packet_loss_variance += (peer.packet_loss - packet_loss) / 4;
        }
        peer.packet_loss_epoch = service_time;
        peer.packets_sent = 0;
        peer.packets_lost = 0;
    }

    /// Finalizes one datagram for `index`: header, optional compression
    /// and checksum, then the socket send. Sent unreliable commands are
    /// settled immediately; they are never retransmitted.
    fn transmit(&mut self, index: usize, block: &[u8], sent_time_needed: bool) -> io::Result<()> {
        let compressed = self.compressor.as_mut().and_then(|compressor| {
            let mut output = vec![0u8; block.len()];
            let size = compressor.compress(&[block], block.len(), &mut output);
            (size > 0 && size < block.len()).then(|| {
                output.truncate(size);
                output
            })
        });

        let peer = &self.peers[index];
        let Some(address) = peer.address else {
            return Ok(());
        };
        let session_id = if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
            peer.outgoing_session_id
        } else {
            0
        };
        let header = DatagramHeader {
            peer_id: peer.outgoing_peer_id,
            session_id,
            compressed: compressed.is_some(),
            sent_time: sent_time_needed.then_some((self.service_time & 0xFFFF) as u16),
        };

        let mut head = BytesMut::new();
        head.write(&header)
            .expect("writing to a growable buffer cannot fail");
        if let Some(checksum) = &mut self.checksum {
            let seed = if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
                peer.connect_id
            } else {
                0
            };
            head.extend_from_slice(&seed.to_be_bytes());
            // checksum covers the uncompressed command block, with the
            // connect ID standing in for the checksum itself
            let value = checksum.checksum(&[&head[..], block]);
            let slot = head.len() - 4;
            head[slot..].copy_from_slice(&value.to_be_bytes());
        }

        let body: &[u8] = compressed.as_deref().unwrap_or(block);
        self.peers[index].last_send_time = self.service_time;
        let result = self.socket.send(address, &[&head[..], body]);
        self.peers[index].remove_sent_unreliable_commands();
        let sent = result?;
        self.total_sent_data += sent as u64;
        self.total_sent_packets += 1;
        Ok(())
    }

    // Receive pass -------------------------------------------------------

    fn receive_incoming_packets(&mut self) -> io::Result<Option<Event>> {
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        for _ in 0..RECEIVE_BUDGET {
            let Some((address, length)) = self.socket.recv(&mut buffer)? else {
                return Ok(None);
            };
            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = &mut self.intercept {
                match intercept(address, &buffer[..length]) {
                    Intercept::Pass => {}
                    Intercept::Consume => continue,
                    Intercept::Event(event) => return Ok(Some(event)),
                    Intercept::Error => {
                        return Err(io::Error::other("receive intercept failed"));
                    }
                }
            }

            if let Some(event) = self.handle_datagram(address, &buffer[..length]) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_lines)]
    fn handle_datagram(&mut self, address: SocketAddr, data: &[u8]) -> Option<Event> {
        let mut cursor = data;
        let header = DatagramHeader::decode(&mut cursor).ok()?;
        let header_size = data.len() - cursor.len();

        let mut peer_index = if header.peer_id == MAXIMUM_PEER_ID {
            None
        } else {
            let index = usize::from(header.peer_id);
            if index >= self.peers.len() {
                return None;
            }
            let peer = &self.peers[index];
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                || peer.address != Some(address)
                || (peer.outgoing_peer_id < MAXIMUM_PEER_ID
                    && header.session_id != peer.incoming_session_id)
            {
                return None;
            }
            Some(index)
        };

        let checksum_len = if self.checksum.is_some() { 4 } else { 0 };
        if data.len() < header_size + checksum_len {
            return None;
        }
        let body = &data[header_size + checksum_len..];

        let mut decompressed = Vec::new();
        let commands: &[u8] = if header.compressed {
            let compressor = self.compressor.as_mut()?;
            decompressed.resize(RECEIVE_BUFFER_SIZE, 0);
            let size = compressor.decompress(body, &mut decompressed);
            if size == 0 || size > RECEIVE_BUFFER_SIZE - header_size - checksum_len {
                trace!(%address, "dropping datagram that failed to decompress");
                return None;
            }
            &decompressed[..size]
        } else {
            body
        };

        if let Some(checksum) = &mut self.checksum {
            let received = u32::from_be_bytes(
                data[header_size..header_size + 4]
                    .try_into()
                    .unwrap_or_else(|_| unreachable!()),
            );
            let seed = peer_index.map_or(0, |index| self.peers[index].connect_id);
            let seed_bytes = seed.to_be_bytes();
            let computed =
                checksum.checksum(&[&data[..header_size], &seed_bytes[..], commands]);
            if computed != received {
                trace!(%address, "dropping datagram with bad checksum");
                return None;
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(address);
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(data.len() as u32);
        }

        let mut event = None;
        let mut cursor = commands;
        while !cursor.is_empty() {
            let Ok(command) = Command::decode(&mut cursor) else {
                break;
            };

            let handled: HandleResult = match &command.info {
                CommandInfo::Connect(connect) => {
                    if peer_index.is_some() {
                        break;
                    }
                    peer_index = self.handle_connect(address, &command, connect);
                    if peer_index.is_none() {
                        break;
                    }
                    Ok(())
                }
                _ => {
                    let Some(index) = peer_index else {
                        break;
                    };
                    match &command.info {
                        CommandInfo::Acknowledge {
                            received_reliable_sequence_number,
                            received_sent_time,
                        } => self.handle_acknowledge(
                            index,
                            &command,
                            *received_reliable_sequence_number,
                            *received_sent_time,
                            &mut event,
                        ),
                        CommandInfo::VerifyConnect(verify) => {
                            self.handle_verify_connect(index, verify, &mut event)
                        }
                        CommandInfo::Disconnect { data } => {
                            self.handle_disconnect(index, &command, *data)
                        }
                        CommandInfo::Ping => self.handle_ping(index),
                        CommandInfo::SendReliable { data_length } => {
                            self.handle_send_reliable(index, &command, *data_length, &mut cursor)
                        }
                        CommandInfo::SendUnreliable { data_length, .. } => {
                            self.handle_send_unreliable(index, &command, *data_length, &mut cursor)
                        }
                        CommandInfo::SendUnsequenced {
                            unsequenced_group,
                            data_length,
                        } => self.handle_send_unsequenced(
                            index,
                            &command,
                            *unsequenced_group,
                            *data_length,
                            &mut cursor,
                        ),
                        CommandInfo::SendFragment(fragment) => {
                            self.handle_send_fragment(index, &command, *fragment, &mut cursor)
                        }
                        CommandInfo::SendUnreliableFragment(fragment) => self
                            .handle_send_unreliable_fragment(
                                index,
                                &command,
                                *fragment,
                                &mut cursor,
                            ),
                        CommandInfo::BandwidthLimit {
                            incoming_bandwidth,
                            outgoing_bandwidth,
                        } => self.handle_bandwidth_limit(
                            index,
                            *incoming_bandwidth,
                            *outgoing_bandwidth,
                        ),
                        CommandInfo::ThrottleConfigure {
                            packet_throttle_interval,
                            packet_throttle_acceleration,
                            packet_throttle_deceleration,
                        } => self.handle_throttle_configure(
                            index,
                            *packet_throttle_interval,
                            *packet_throttle_acceleration,
                            *packet_throttle_deceleration,
                        ),
                        CommandInfo::Connect(_) => unreachable!(),
                    }
                }
            };

            if handled.is_err() {
                trace!(%address, opcode = ?command.info.opcode(), "aborting datagram");
                break;
            }

            if command.flags.wants_acknowledge() {
                let Some(index) = peer_index else {
                    break;
                };
                let Some(sent_time) = header.sent_time else {
                    break;
                };
                match self.peers[index].state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}
                    PeerState::AcknowledgingDisconnect => {
                        if command.info.opcode() == Opcode::Disconnect {
                            self.peers[index].queue_acknowledgement(&command, sent_time);
                        }
                    }
                    _ => {
                        self.peers[index].queue_acknowledgement(&command, sent_time);
                    }
                }
            }
        }

        event
    }

    // Handlers -----------------------------------------------------------

    fn handle_connect(
        &mut self,
        address: SocketAddr,
        command: &Command,
        connect: &Connect,
    ) -> Option<usize> {
        if command.channel_id != 0xFF {
            return None;
        }
        let channel_count = connect.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0usize;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.map(|a| a.ip()) == Some(address.ip())
            {
                if peer.address == Some(address) && peer.connect_id == connect.connect_id {
                    // a retransmission of a connect we already claimed
                    return None;
                }
                duplicate_peers += 1;
            }
        }
        let index = slot?;
        if duplicate_peers >= self.duplicate_peers {
            warn!(%address, "refusing connect: too many peers from this address");
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let window_size = self.next_connect_window_size(connect.incoming_bandwidth);
        let unclamped = if self.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (self.incoming_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };
        let verify_window_size = unclamped
            .min(connect.window_size)
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        let incoming_bandwidth = self.incoming_bandwidth;
        let outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.state = PeerState::AcknowledgingConnect;
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.address = Some(address);
        peer.connect_id = connect.connect_id;
        peer.outgoing_peer_id = connect.outgoing_peer_id;
        peer.incoming_bandwidth = connect.incoming_bandwidth;
        peer.outgoing_bandwidth = connect.outgoing_bandwidth;
        peer.packet_throttle_interval = connect.packet_throttle_interval;
        peer.packet_throttle_acceleration = connect.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = connect.packet_throttle_deceleration;
        peer.event_data = connect.data;
        peer.mtu = connect.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        peer.window_size = window_size;

        let mut incoming_session = if connect.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            connect.incoming_session_id
        };
        incoming_session = (incoming_session.wrapping_add(1)) & 3;
        if incoming_session == peer.outgoing_session_id {
            incoming_session = (incoming_session.wrapping_add(1)) & 3;
        }
        peer.outgoing_session_id = incoming_session;

        let mut outgoing_session = if connect.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            connect.outgoing_session_id
        };
        outgoing_session = (outgoing_session.wrapping_add(1)) & 3;
        if outgoing_session == peer.incoming_session_id {
            outgoing_session = (outgoing_session.wrapping_add(1)) & 3;
        }
        peer.incoming_session_id = outgoing_session;

        let verify = Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0xFF,
            reliable_sequence_number: 0,
            info: CommandInfo::VerifyConnect(VerifyConnect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.outgoing_session_id,
                outgoing_session_id: peer.incoming_session_id,
                mtu: peer.mtu,
                window_size: verify_window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        };
        peer.queue_outgoing_command(verify, None, 0, 0);

        debug!(peer = index, %address, "accepting connect");
        Some(index)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        verify: &VerifyConnect,
        event: &mut Option<Event>,
    ) -> HandleResult {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = verify.channel_count as usize;
        {
            let peer = &self.peers[index];
            if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
                || verify.packet_throttle_interval != peer.packet_throttle_interval
                || verify.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || verify.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || verify.connect_id != peer.connect_id
            {
                debug!(peer = index, "verify connect does not match our connect");
                self.peers[index].event_data = 0;
                self.dispatch_state(index, PeerState::Zombie);
                return Err(CommandError);
            }
        }

        // our CONNECT was control-channel sequence 1
        self.peers[index].remove_sent_reliable_command(1, 0xFF);

        let peer = &mut self.peers[index];
        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = verify.outgoing_peer_id;
        peer.incoming_session_id = verify.incoming_session_id;
        peer.outgoing_session_id = verify.outgoing_session_id;

        let mtu = verify.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }
        let window_size = verify
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }
        peer.incoming_bandwidth = verify.incoming_bandwidth;
        peer.outgoing_bandwidth = verify.outgoing_bandwidth;

        self.notify_connect(index, Some(event));
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command, data: u32) -> HandleResult {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.reset_peer_queues(index);
        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if command.flags.wants_acknowledge() {
                    self.change_state(index, PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(index, PeerState::Zombie);
                }
            }
            _ => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_peer_slot(index);
            }
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }
        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> HandleResult {
        if matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            Ok(())
        } else {
            Err(CommandError)
        }
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn handle_acknowledge(
        &mut self,
        index: usize,
        command: &Command,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
        event: &mut Option<Event>,
    ) -> HandleResult {
        let state = self.peers[index].state;
        if matches!(state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(());
        }

        // widen the 16-bit echo against our clock, correcting for a wrap
        // between send and acknowledgement
        let mut received_sent_time = u32::from(received_sent_time);
        received_sent_time |= self.service_time & 0xFFFF_0000;
        if (received_sent_time & 0x8000) > (self.service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }
        if time_less(self.service_time, received_sent_time) {
            return Ok(());
        }

        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        peer.last_receive_time = service_time;
        peer.earliest_timeout = 0;

        let round_trip_time = time_difference(service_time, received_sent_time);
        peer.throttle(round_trip_time);

        peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;
        if round_trip_time >= peer.round_trip_time {
            peer.round_trip_time += (round_trip_time - peer.round_trip_time) / 8;
            peer.round_trip_time_variance += (round_trip_time - peer.round_trip_time) / 4;
        } else {
            peer.round_trip_time -= (peer.round_trip_time - round_trip_time) / 8;
            peer.round_trip_time_variance += (peer.round_trip_time - round_trip_time) / 4;
        }

        if peer.round_trip_time < peer.lowest_round_trip_time {
            peer.lowest_round_trip_time = peer.round_trip_time;
        }
        if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
        }

        if peer.packet_throttle_epoch == 0
            || time_difference(service_time, peer.packet_throttle_epoch)
                >= peer.packet_throttle_interval
        {
            peer.last_round_trip_time = peer.lowest_round_trip_time;
            peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance;
            peer.lowest_round_trip_time = peer.round_trip_time;
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            peer.packet_throttle_epoch = service_time;
        }

        let opcode =
            peer.remove_sent_reliable_command(received_reliable_sequence_number, command.channel_id);

        match state {
            PeerState::AcknowledgingConnect => {
                if opcode != Some(Opcode::VerifyConnect) {
                    return Err(CommandError);
                }
                self.notify_connect(index, Some(event));
            }
            PeerState::Disconnecting => {
                if opcode != Some(Opcode::Disconnect) {
                    return Err(CommandError);
                }
                self.notify_disconnect(index, Some(event));
            }
            PeerState::DisconnectLater => {
                if !self.peers[index].has_outgoing_commands() {
                    let data = self.peers[index].event_data;
                    self.disconnect(PeerId(index as u16), data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_bandwidth_limit(
        &mut self,
        index: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> HandleResult {
        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return Err(CommandError);
        }

        if self.peers[index].incoming_bandwidth != 0 {
            self.bandwidth_limited_peers = self.bandwidth_limited_peers.saturating_sub(1);
        }
        self.peers[index].incoming_bandwidth = incoming_bandwidth;
        self.peers[index].outgoing_bandwidth = outgoing_bandwidth;
        if incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }

        let window_size = self.next_connect_window_size(incoming_bandwidth);
        self.peers[index].window_size = window_size;
        Ok(())
    }

    fn handle_throttle_configure(
        &mut self,
        index: usize,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> HandleResult {
        if !matches!(
            self.peers[index].state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return Err(CommandError);
        }
        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;
        Ok(())
    }

    fn check_send_state(&self, index: usize, channel_id: u8) -> HandleResult {
        let peer = &self.peers[index];
        if usize::from(channel_id) >= peer.channels.len()
            || !matches!(
                peer.state,
                PeerState::Connected | PeerState::DisconnectLater
            )
        {
            return Err(CommandError);
        }
        Ok(())
    }

    fn take_payload<'a>(
        &self,
        cursor: &mut &'a [u8],
        data_length: u16,
    ) -> Result<&'a [u8], CommandError> {
        let length = usize::from(data_length);
        if length > cursor.len() || length > self.maximum_packet_size {
            return Err(CommandError);
        }
        let (payload, rest) = cursor.split_at(length);
        *cursor = rest;
        Ok(payload)
    }

    fn handle_send_reliable(
        &mut self,
        index: usize,
        command: &Command,
        data_length: u16,
        cursor: &mut &[u8],
    ) -> HandleResult {
        self.check_send_state(index, command.channel_id)?;
        let payload = self.take_payload(cursor, data_length)?;
        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            command,
            Some(payload),
            payload.len(),
            PacketFlags::RELIABLE,
            0,
            maximum_waiting_data,
        ) {
            Admission::Refused => Err(CommandError),
            Admission::Discarded => Ok(()),
            Admission::Accepted { .. } => {
                self.peers[index]
                    .dispatch_incoming_reliable_commands(command.channel_id, &mut self.dispatch_queue);
                Ok(())
            }
        }
    }

    fn handle_send_unreliable(
        &mut self,
        index: usize,
        command: &Command,
        data_length: u16,
        cursor: &mut &[u8],
    ) -> HandleResult {
        self.check_send_state(index, command.channel_id)?;
        let payload = self.take_payload(cursor, data_length)?;
        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            command,
            Some(payload),
            payload.len(),
            PacketFlags::NONE,
            0,
            maximum_waiting_data,
        ) {
            Admission::Refused => Err(CommandError),
            Admission::Discarded => Ok(()),
            Admission::Accepted { .. } => {
                self.peers[index].dispatch_incoming_unreliable_commands(
                    command.channel_id,
                    &mut self.dispatch_queue,
                );
                Ok(())
            }
        }
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        unsequenced_group: u16,
        data_length: u16,
        cursor: &mut &[u8],
    ) -> HandleResult {
        self.check_send_state(index, command.channel_id)?;
        let payload = self.take_payload(cursor, data_length)?;

        if !self.peers[index].admit_unsequenced(unsequenced_group) {
            return Ok(());
        }

        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            command,
            Some(payload),
            payload.len(),
            PacketFlags::UNSEQUENCED,
            0,
            maximum_waiting_data,
        ) {
            Admission::Refused => Err(CommandError),
            admitted => {
                self.peers[index].mark_unsequenced(unsequenced_group);
                if matches!(admitted, Admission::Accepted { .. }) {
                    self.peers[index].dispatch_incoming_unreliable_commands(
                        command.channel_id,
                        &mut self.dispatch_queue,
                    );
                }
                Ok(())
            }
        }
    }

    fn validate_fragment(&self, fragment: &SendFragment) -> HandleResult {
        if fragment.fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment.fragment_number >= fragment.fragment_count
            || fragment.total_length as usize > self.maximum_packet_size
            || fragment.fragment_offset >= fragment.total_length
            || u32::from(fragment.data_length) > fragment.total_length - fragment.fragment_offset
        {
            return Err(CommandError);
        }
        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        fragment: SendFragment,
        cursor: &mut &[u8],
    ) -> HandleResult {
        self.check_send_state(index, command.channel_id)?;
        let payload = self.take_payload(cursor, fragment.data_length)?;

        let channel_index = usize::from(command.channel_id);
        let start_sequence_number = fragment.start_sequence_number;
        let current =
            self.peers[index].channels[channel_index].incoming_reliable_sequence_number;
        if !window_acceptable(start_sequence_number, current) {
            return Ok(());
        }
        self.validate_fragment(&fragment)?;

        // an earlier fragment of the same message may have opened the
        // reassembly already
        let mut reassembly = None;
        {
            let channel = &self.peers[index].channels[channel_index];
            let ahead = start_sequence_number >= current;
            let queue = &channel.incoming_reliable_commands;
            for i in (0..queue.len()).rev() {
                let existing = &queue[i];
                if ahead {
                    if existing.reliable_sequence_number < current {
                        continue;
                    }
                } else if existing.reliable_sequence_number >= current {
                    break;
                }
                if existing.reliable_sequence_number <= start_sequence_number {
                    if existing.reliable_sequence_number < start_sequence_number {
                        break;
                    }
                    if existing.opcode() != Opcode::SendFragment
                        || existing.payload.len() as u32 != fragment.total_length
                        || existing.fragment_count != fragment.fragment_count
                    {
                        return Err(CommandError);
                    }
                    reassembly = Some(i);
                    break;
                }
            }
        }

        let slot = match reassembly {
            Some(slot) => slot,
            None => {
                let mut start_command = *command;
                start_command.reliable_sequence_number = start_sequence_number;
                let maximum_waiting_data = self.maximum_waiting_data;
                match self.peers[index].queue_incoming_command(
                    &start_command,
                    None,
                    fragment.total_length as usize,
                    PacketFlags::RELIABLE,
                    fragment.fragment_count,
                    maximum_waiting_data,
                ) {
                    Admission::Accepted { index } => index,
                    _ => return Err(CommandError),
                }
            }
        };

        self.fill_fragment(index, channel_index, false, slot, &fragment, payload)
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        fragment: SendFragment,
        cursor: &mut &[u8],
    ) -> HandleResult {
        self.check_send_state(index, command.channel_id)?;
        let payload = self.take_payload(cursor, fragment.data_length)?;

        let channel_index = usize::from(command.channel_id);
        let reliable_sequence_number = command.reliable_sequence_number;
        let start_sequence_number = fragment.start_sequence_number;
        let channel = &self.peers[index].channels[channel_index];
        let current = channel.incoming_reliable_sequence_number;

        if !window_acceptable(reliable_sequence_number, current) {
            return Ok(());
        }
        if reliable_sequence_number == current
            && start_sequence_number <= channel.incoming_unreliable_sequence_number
        {
            return Ok(());
        }
        self.validate_fragment(&fragment)?;

        let mut reassembly = None;
        {
            let channel = &self.peers[index].channels[channel_index];
            let ahead = reliable_sequence_number >= current;
            let queue = &channel.incoming_unreliable_commands;
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
                    break;
                }
                if existing.reliable_sequence_number < reliable_sequence_number {
                    break;
                }
                if existing.reliable_sequence_number > reliable_sequence_number {
                    continue;
                }
                if existing.unreliable_sequence_number <= start_sequence_number {
                    if existing.unreliable_sequence_number < start_sequence_number {
                        break;
                    }
                    if existing.opcode() != Opcode::SendUnreliableFragment
                        || existing.payload.len() as u32 != fragment.total_length
                        || existing.fragment_count != fragment.fragment_count
                    {
                        return Err(CommandError);
                    }
                    reassembly = Some(i);
                    break;
                }
            }
        }

        let slot = match reassembly {
            Some(slot) => slot,
            None => {
                let maximum_waiting_data = self.maximum_waiting_data;
                match self.peers[index].queue_incoming_command(
                    command,
                    None,
                    fragment.total_length as usize,
                    PacketFlags::UNRELIABLE_FRAGMENT,
                    fragment.fragment_count,
                    maximum_waiting_data,
                ) {
                    Admission::Accepted { index } => index,
                    _ => return Err(CommandError),
                }
            }
        };

        self.fill_fragment(index, channel_index, true, slot, &fragment, payload)
    }

    /// Copies one fragment's bytes into its reassembly at the fragment
    /// offset, and dispatches the channel once the message is whole.
    fn fill_fragment(
        &mut self,
        index: usize,
        channel_index: usize,
        unreliable: bool,
        slot: usize,
        fragment: &SendFragment,
        payload: &[u8],
    ) -> HandleResult {
        let channel_id = channel_index as u8;
        let complete = {
            let channel = &mut self.peers[index].channels[channel_index];
            let entry = if unreliable {
                &mut channel.incoming_unreliable_commands[slot]
            } else {
                &mut channel.incoming_reliable_commands[slot]
            };
            let bit = fragment.fragment_number as usize;
            let Some(bits) = entry.fragments.as_mut() else {
                return Err(CommandError);
            };
            if bits[bit] {
                false
            } else {
                bits.set(bit, true);
                entry.fragments_remaining -= 1;

                let offset = fragment.fragment_offset as usize;
                let length = payload.len().min(entry.payload.len() - offset);
                entry.payload[offset..offset + length].copy_from_slice(&payload[..length]);
                entry.fragments_remaining == 0
            }
        };

        if complete {
            if unreliable {
                self.peers[index]
                    .dispatch_incoming_unreliable_commands(channel_id, &mut self.dispatch_queue);
            } else {
                self.peers[index]
                    .dispatch_incoming_reliable_commands(channel_id, &mut self.dispatch_queue);
            }
        }
        Ok(())
    }
}

const FREE_WINDOW_MASK: u16 = (1 << FREE_RELIABLE_WINDOWS) - 1;

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;
    use crate::{
        command::OutgoingCommand,
        host::HostConfig,
        packet::Packet,
        socket::Socket,
        time::ManualClock,
    };

    /// Socket that records every datagram it is told to send.
    #[derive(Default)]
    struct RecordingSocket {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Socket for RecordingSocket {
        fn send(&mut self, _address: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
            let datagram: Vec<u8> = buffers.concat();
            let length = datagram.len();
            self.sent.borrow_mut().push(datagram);
            Ok(length)
        }

        fn recv(&mut self, _buffer: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
            Ok(None)
        }

        fn wait(&mut self, condition: &mut WaitCondition, _timeout: Duration) -> io::Result<()> {
            *condition = WaitCondition::NONE;
            Ok(())
        }
    }

    fn connected_host() -> (Host, Rc<RefCell<Vec<Vec<u8>>>>) {
        let socket = RecordingSocket::default();
        let sent = Rc::clone(&socket.sent);
        let mut host = Host::new(
            Box::new(socket),
            Box::new(ManualClock::new(1000)),
            HostConfig::default(),
        )
        .unwrap();
        let peer = &mut host.peers[0];
        peer.state = PeerState::Connected;
        peer.address = Some("127.0.0.1:5000".parse().unwrap());
        peer.outgoing_peer_id = 0;
        peer.channels = vec![Channel::new()];
        // recently heard from, so no keepalive muddies the assertions
        peer.last_receive_time = 1000;
        (host, sent)
    }

    fn reliable_payload_command(reliable_sequence_number: u16, payload: &'static [u8]) -> OutgoingCommand {
        let mut command = OutgoingCommand::new(
            Command {
                flags: CommandFlags::ACKNOWLEDGE,
                channel_id: 0,
                reliable_sequence_number,
                info: CommandInfo::SendReliable {
                    data_length: payload.len() as u16,
                },
            },
            Some(Packet::reliable(payload)),
            0,
            payload.len() as u16,
        );
        command.reliable_sequence_number = reliable_sequence_number;
        command
    }

    #[test]
    fn fresh_window_defers_while_band_is_full() {
        let (mut host, sent) = connected_host();
        // window 8 still has unacknowledged data; starting window 1 would
        // wrap the free band
        host.peers[0].channels[0].used_reliable_windows = 1 << 8;
        host.peers[0].channels[0].reliable_windows[8] = 1;
        host.peers[0]
            .outgoing_reliable_commands
            .push_back(reliable_payload_command(0x1000, b"x"));

        host.flush().unwrap();

        assert_eq!(1, host.peers[0].outgoing_reliable_commands.len());
        assert!(host.peers[0].sent_reliable_commands.is_empty());
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn reliable_window_budget_defers_payloads() {
        let (mut host, sent) = connected_host();
        host.peers[0].window_size = 4096;
        host.peers[0].reliable_data_in_transit = 4090;
        host.peers[0]
            .outgoing_reliable_commands
            .push_back(reliable_payload_command(1, b"this does not fit in the window"));

        host.flush().unwrap();
        assert_eq!(1, host.peers[0].outgoing_reliable_commands.len());
        assert!(sent.borrow().is_empty());

        // with the transit budget released, it goes out
        host.peers[0].reliable_data_in_transit = 0;
        host.flush().unwrap();
        assert!(host.peers[0].outgoing_reliable_commands.is_empty());
        assert_eq!(1, host.peers[0].sent_reliable_commands.len());
        assert_eq!(1, sent.borrow().len());
    }

    #[test]
    fn zero_throttle_starves_unreliable_sends() {
        let (mut host, sent) = connected_host();
        host.peers[0].packet_throttle = 0;
        for _ in 0..10 {
            host.peers[0]
                .send(0, Packet::unreliable(vec![0u8; 100]), false, 1 << 20)
                .unwrap();
        }

        host.flush().unwrap();

        assert!(host.peers[0].outgoing_unreliable_commands.is_empty());
        assert!(host.peers[0].sent_unreliable_commands.is_empty());
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn reliable_sends_carry_sent_time_and_ping_waits() {
        let (mut host, sent) = connected_host();
        host.peers[0]
            .send(0, Packet::reliable(vec![1, 2, 3]), false, 1 << 20)
            .unwrap();
        host.flush().unwrap();

        assert_eq!(1, sent.borrow().len());
        let datagram = sent.borrow()[0].clone();
        let mut cursor = &datagram[..];
        let header = DatagramHeader::decode(&mut cursor).unwrap();
        assert_eq!(Some((1000 & 0xFFFF) as u16), header.sent_time);

        // nothing more to say and the peer was heard from recently: quiet
        sent.borrow_mut().clear();
        host.peers[0].last_receive_time = 1000;
        let mut sent_command = host.peers[0].sent_reliable_commands.pop_front().unwrap();
        sent_command.round_trip_timeout = u32::MAX / 2;
        host.peers[0].sent_reliable_commands.push_back(sent_command);
        host.flush().unwrap();
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn acknowledgements_flush_first() {
        let (mut host, sent) = connected_host();
        let acked = Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 1,
            info: CommandInfo::SendReliable { data_length: 1 },
        };
        assert!(host.peers[0].queue_acknowledgement(&acked, 0x0123));

        host.flush().unwrap();

        let datagrams = sent.borrow();
        assert_eq!(1, datagrams.len());
        let mut cursor = &datagrams[0][..];
        let header = DatagramHeader::decode(&mut cursor).unwrap();
        // acknowledgements alone do not ask to be timed
        assert_eq!(None, header.sent_time);
        let command = Command::decode(&mut cursor).unwrap();
        let CommandInfo::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.info
        else {
            panic!("expected acknowledge, got {command:?}");
        };
        assert_eq!(1, received_reliable_sequence_number);
        assert_eq!(0x0123, received_sent_time);
    }

    #[test]
    fn fragments_reassemble_in_any_order() {
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let half = 300usize;

        let fragment = |number: u32, offset: usize| SendFragment {
            start_sequence_number: 1,
            data_length: half as u16,
            fragment_count: 2,
            fragment_number: number,
            total_length: payload.len() as u32,
            fragment_offset: offset as u32,
        };
        let command = |fragment: SendFragment| Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: 1,
            info: CommandInfo::SendFragment(fragment),
        };

        // second fragment first
        let (mut host, _sent) = connected_host();
        let second = fragment(1, half);
        let mut cursor = &payload[half..];
        host.handle_send_fragment(0, &command(second), second, &mut cursor)
            .ok()
            .unwrap();
        assert!(host.peers[0].dispatched_commands.is_empty());

        let first = fragment(0, 0);
        let mut cursor = &payload[..half];
        host.handle_send_fragment(0, &command(first), first, &mut cursor)
            .ok()
            .unwrap();

        let (channel_id, packet) = host.peers[0].receive_dispatched().unwrap();
        assert_eq!(0, channel_id);
        assert_eq!(payload, packet.data());
        assert_eq!(2, host.peers[0].channels[0].incoming_reliable_sequence_number);

        // a duplicate of an already-seen fragment changes nothing
        let mut cursor = &payload[..half];
        assert!(host
            .handle_send_fragment(0, &command(first), first, &mut cursor)
            .is_ok());
        assert!(host.peers[0].dispatched_commands.is_empty());
    }

    #[test]
    fn dispatch_queue_drains_one_event_per_call() {
        let (mut host, _sent) = connected_host();
        let max = usize::MAX;
        let make = |seq: u16, data: &'static [u8]| Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: seq,
            info: CommandInfo::SendReliable {
                data_length: data.len() as u16,
            },
        };
        let mut dispatch_queue = VecDeque::new();
        host.peers[0].queue_incoming_command(&make(1, b"a"), Some(b"a"), 1, PacketFlags::RELIABLE, 0, max);
        host.peers[0].queue_incoming_command(&make(2, b"b"), Some(b"b"), 1, PacketFlags::RELIABLE, 0, max);
        host.peers[0].dispatch_incoming_reliable_commands(0, &mut dispatch_queue);
        host.dispatch_queue = dispatch_queue;

        let first = host.check_events();
        assert!(matches!(first, Some(Event::Receive { .. })));
        let second = host.check_events();
        assert!(matches!(second, Some(Event::Receive { .. })));
        assert!(host.check_events().is_none());
    }
}
