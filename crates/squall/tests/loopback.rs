//! End-to-end scenarios: two hosts joined by an in-memory datagram link,
//! driven by a hand-advanced clock so every timer is deterministic.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use assert_matches::assert_matches;
use squall::{
    socket::{Socket, WaitCondition},
    time::ManualClock,
    Event, Host, HostConfig, Packet, PeerState,
};

type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// One end of a lossless-by-default in-memory link. Datagrams can be
/// dropped on demand to simulate loss.
struct MemorySocket {
    address: SocketAddr,
    remote_address: SocketAddr,
    incoming: Queue,
    outgoing: Queue,
    /// Number of upcoming sends to drop on the floor.
    drop_next: Rc<Cell<u32>>,
}

impl Socket for MemorySocket {
    fn send(&mut self, address: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
        assert_eq!(self.remote_address, address, "only one remote on this link");
        let datagram: Vec<u8> = buffers.concat();
        let length = datagram.len();
        if self.drop_next.get() > 0 {
            self.drop_next.set(self.drop_next.get() - 1);
        } else {
            self.outgoing.borrow_mut().push_back(datagram);
        }
        Ok(length)
    }

    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        let Some(datagram) = self.incoming.borrow_mut().pop_front() else {
            return Ok(None);
        };
        let length = datagram.len().min(buffer.len());
        buffer[..length].copy_from_slice(&datagram[..length]);
        Ok(Some((self.remote_address, length)))
    }

    fn wait(&mut self, condition: &mut WaitCondition, _timeout: Duration) -> io::Result<()> {
        *condition = if condition.contains(WaitCondition::RECEIVE)
            && !self.incoming.borrow().is_empty()
        {
            WaitCondition::RECEIVE
        } else {
            WaitCondition::NONE
        };
        Ok(())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.address)
    }
}

struct Link {
    initiator: Host,
    responder: Host,
    responder_address: SocketAddr,
    clock: ManualClock,
    initiator_drop: Rc<Cell<u32>>,
    #[allow(dead_code)]
    responder_drop: Rc<Cell<u32>>,
}

fn link_with(configure: impl Fn(&mut HostConfig)) -> Link {
    let initiator_address: SocketAddr = "10.1.0.1:4100".parse().unwrap();
    let responder_address: SocketAddr = "10.1.0.2:4100".parse().unwrap();
    let to_responder: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let to_initiator: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let initiator_drop = Rc::new(Cell::new(0));
    let responder_drop = Rc::new(Cell::new(0));

    // start well past zero so "never" sentinels stay unambiguous
    let clock = ManualClock::new(1000);

    let mut config = HostConfig {
        peer_count: 4,
        ..HostConfig::default()
    };
    configure(&mut config);

    let initiator = Host::new(
        Box::new(MemorySocket {
            address: initiator_address,
            remote_address: responder_address,
            incoming: Rc::clone(&to_initiator),
            outgoing: Rc::clone(&to_responder),
            drop_next: Rc::clone(&initiator_drop),
        }),
        Box::new(clock.clone()),
        config.clone(),
    )
    .unwrap();
    let responder = Host::new(
        Box::new(MemorySocket {
            address: responder_address,
            remote_address: initiator_address,
            incoming: Rc::clone(&to_responder),
            outgoing: Rc::clone(&to_initiator),
            drop_next: Rc::clone(&responder_drop),
        }),
        Box::new(clock.clone()),
        config,
    )
    .unwrap();

    Link {
        initiator,
        responder,
        responder_address,
        clock,
        initiator_drop,
        responder_drop,
    }
}

fn link() -> Link {
    link_with(|_| {})
}

impl Link {
    /// Services both hosts once, advancing the clock a step, collecting
    /// any events.
    fn tick(&mut self, step: u32) -> (Vec<Event>, Vec<Event>) {
        let mut from_initiator = Vec::new();
        let mut from_responder = Vec::new();
        // drain multiple events per side per tick
        while let Some(event) = self.initiator.service(0).unwrap() {
            from_initiator.push(event);
        }
        while let Some(event) = self.responder.service(0).unwrap() {
            from_responder.push(event);
        }
        self.clock.advance(step);
        (from_initiator, from_responder)
    }

    /// Drives the connect handshake to completion on both sides.
    fn establish(&mut self, channel_count: usize, data: u32) -> (squall::PeerId, squall::PeerId) {
        let initiated = self
            .initiator
            .connect(self.responder_address, channel_count, data)
            .unwrap();
        let mut accepted = None;
        let mut initiator_connected = false;

        for _ in 0..10 {
            let (from_initiator, from_responder) = self.tick(20);
            for event in from_initiator {
                if let Event::Connect { peer, .. } = event {
                    assert_eq!(initiated, peer);
                    initiator_connected = true;
                }
            }
            for event in from_responder {
                if let Event::Connect { peer, data: seen } = event {
                    assert_eq!(data, seen);
                    accepted = Some(peer);
                }
            }
            if initiator_connected && accepted.is_some() {
                break;
            }
        }

        let accepted = accepted.expect("responder never saw the connection");
        assert!(initiator_connected, "initiator never saw the connection");
        (initiated, accepted)
    }
}

#[test]
fn connect_and_ping() {
    let mut link = link();
    let (initiated, accepted) = link.establish(1, 7);

    assert_eq!(PeerState::Connected, link.initiator.peer(initiated).state());
    assert_eq!(PeerState::Connected, link.responder.peer(accepted).state());
    assert_eq!(1, link.initiator.connected_peers());
    assert_eq!(1, link.responder.connected_peers());

    // let pings and their acknowledgements circulate for a while
    for _ in 0..10 {
        link.tick(200);
    }
    assert_eq!(PeerState::Connected, link.initiator.peer(initiated).state());
    assert_eq!(PeerState::Connected, link.responder.peer(accepted).state());
}

#[test]
fn reliable_delivery_is_in_order() {
    let mut link = link();
    let (initiated, _) = link.establish(1, 0);

    let payloads: [&[u8]; 3] = [&[0x01], &[0x02, 0x03], &[0x04]];
    for payload in payloads {
        link.initiator
            .send(initiated, 0, Packet::reliable(payload))
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        let (_, from_responder) = link.tick(20);
        for event in from_responder {
            if let Event::Receive {
                channel_id, packet, ..
            } = event
            {
                assert_eq!(0, channel_id);
                received.push(packet.data().to_vec());
            }
        }
        if received.len() == payloads.len() {
            break;
        }
    }

    assert_eq!(
        payloads.iter().map(|p| p.to_vec()).collect::<Vec<_>>(),
        received
    );
    // everything acknowledged: nothing pending on the sender
    assert!(!link.initiator.peer(initiated).has_pending_outgoing());
    assert_eq!(0, link.initiator.peer(initiated).reliable_data_in_transit());
}

#[test]
fn fragmentation_reassembles_under_small_mtu() {
    let mut link = link_with(|config| config.mtu = 576);
    link.initiator.checksum_with_crc32();
    link.responder.checksum_with_crc32();
    let (initiated, _) = link.establish(1, 0);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    link.initiator
        .send(initiated, 0, Packet::reliable(payload.clone()))
        .unwrap();

    let mut received = None;
    for _ in 0..20 {
        let (_, from_responder) = link.tick(20);
        for event in from_responder {
            if let Event::Receive { packet, .. } = event {
                received = Some(packet);
            }
        }
        if received.is_some() {
            break;
        }
    }

    let received = received.expect("fragmented message never arrived");
    assert_eq!(payload.len(), received.len());
    assert_eq!(payload, received.data());

    // drain the last acknowledgements
    for _ in 0..5 {
        link.tick(20);
    }
    assert!(!link.initiator.peer(initiated).has_pending_outgoing());
    assert_eq!(0, link.initiator.peer(initiated).reliable_data_in_transit());
}

#[test]
fn zero_throttle_starves_unreliable_delivery() {
    let mut link = link();
    let (initiated, _) = link.establish(1, 0);

    link.initiator
        .peer_mut(initiated)
        .set_packet_throttle(0);
    for _ in 0..10 {
        link.initiator
            .send(initiated, 0, Packet::unreliable(vec![0xAA; 100]))
            .unwrap();
    }

    let mut received = 0;
    for _ in 0..10 {
        let (_, from_responder) = link.tick(20);
        received += from_responder
            .iter()
            .filter(|event| matches!(event, Event::Receive { .. }))
            .count();
    }
    assert_eq!(0, received);
}

#[test]
fn lost_reliable_datagram_is_retransmitted_once_delivered_once() {
    let mut link = link();
    let (initiated, _) = link.establish(1, 0);

    // the next datagram the initiator sends vanishes in transit
    link.initiator_drop.set(1);
    link.initiator
        .send(initiated, 0, Packet::reliable(&b"persistent"[..]))
        .unwrap();

    let mut deliveries = Vec::new();
    // walk time forward past the retransmission timeout
    for _ in 0..60 {
        let (_, from_responder) = link.tick(100);
        for event in from_responder {
            if let Event::Receive { packet, .. } = event {
                deliveries.push(packet.data().to_vec());
            }
        }
    }

    assert_eq!(vec![b"persistent".to_vec()], deliveries);
    assert!(!link.initiator.peer(initiated).has_pending_outgoing());
}

#[test]
fn silent_remote_times_out_with_disconnect_event() {
    let mut link = link();
    let (initiated, _) = link.establish(1, 0);

    // give up after a few doublings rather than the defaults' half minute
    link.initiator.set_timeout(initiated, 4, 2000, 10_000);
    // something reliable in flight, and a remote that has gone dark
    link.initiator
        .send(initiated, 0, Packet::reliable(&b"anyone there?"[..]))
        .unwrap();

    let mut disconnect = None;
    for _ in 0..200 {
        link.clock.advance(250);
        while let Some(event) = link.initiator.service(0).unwrap() {
            if matches!(event, Event::Disconnect { .. }) {
                disconnect = Some(event);
            }
        }
        if disconnect.is_some() {
            break;
        }
    }

    assert_matches!(disconnect, Some(Event::Disconnect { peer, .. }) if peer == initiated);
    assert_eq!(
        PeerState::Disconnected,
        link.initiator.peer(initiated).state()
    );
}

#[test]
fn graceful_disconnect_notifies_both_sides() {
    let mut link = link();
    let (initiated, accepted) = link.establish(1, 0);

    link.initiator.disconnect(initiated, 99);

    let mut initiator_saw = false;
    let mut responder_saw = false;
    for _ in 0..10 {
        let (from_initiator, from_responder) = link.tick(20);
        for event in from_initiator {
            if matches!(event, Event::Disconnect { .. }) {
                initiator_saw = true;
            }
        }
        for event in from_responder {
            if let Event::Disconnect { peer, data } = event {
                assert_eq!(accepted, peer);
                assert_eq!(99, data);
                responder_saw = true;
            }
        }
        if initiator_saw && responder_saw {
            break;
        }
    }

    assert!(initiator_saw, "initiator never saw its disconnect");
    assert!(responder_saw, "responder never saw the disconnect");
    assert_eq!(
        PeerState::Disconnected,
        link.initiator.peer(initiated).state()
    );
    assert_eq!(
        PeerState::Disconnected,
        link.responder.peer(accepted).state()
    );
}

#[test]
fn unsequenced_messages_all_arrive() {
    let mut link = link();
    let (initiated, _) = link.establish(1, 0);

    for byte in 0..5u8 {
        link.initiator
            .send(initiated, 0, Packet::unsequenced(vec![byte]))
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        let (_, from_responder) = link.tick(20);
        for event in from_responder {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data()[0]);
            }
        }
    }
    received.sort_unstable();
    assert_eq!(vec![0, 1, 2, 3, 4], received);
}

#[test]
fn compressed_link_round_trips() {
    let mut link = link();
    link.initiator.compress_with_range_coder();
    link.responder.compress_with_range_coder();
    link.initiator.checksum_with_crc32();
    link.responder.checksum_with_crc32();
    let (initiated, _) = link.establish(1, 0);

    // highly compressible payload, large enough to matter
    let payload = b"all work and no play makes jack a dull boy. ".repeat(20);
    link.initiator
        .send(initiated, 0, Packet::reliable(payload.clone()))
        .unwrap();

    let mut received = None;
    for _ in 0..10 {
        let (_, from_responder) = link.tick(20);
        for event in from_responder {
            if let Event::Receive { packet, .. } = event {
                received = Some(packet);
            }
        }
        if received.is_some() {
            break;
        }
    }

    assert_eq!(payload, received.expect("message never arrived").data());
}
