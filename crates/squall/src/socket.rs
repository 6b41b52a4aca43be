//! The datagram socket adapter.
//!
//! The protocol engine talks to the network through the [`Socket`] trait:
//! an unreliable, unordered, message-boundary-preserving transport. The
//! shipped implementation is [`UdpTransport`], a non-blocking UDP socket
//! whose [`Socket::wait`] is poll(2); tests substitute in-memory links.

use std::{io, net::SocketAddr, time::Duration};

/// Readiness and wake-up conditions for [`Socket::wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitCondition(pub u32);

impl WaitCondition {
    /// Nothing to wait for.
    pub const NONE: Self = Self(0);
    /// The socket can accept an outgoing datagram.
    pub const SEND: Self = Self(1 << 0);
    /// A datagram is ready to be received.
    pub const RECEIVE: Self = Self(1 << 1);
    /// The wait was interrupted before anything became ready.
    pub const INTERRUPT: Self = Self(1 << 2);

    /// Whether every condition in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two condition sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// An unreliable datagram transport.
///
/// Datagrams may be dropped, duplicated or reordered; the protocol engine
/// assumes nothing else. All operations are non-blocking except [`wait`],
/// which blocks up to a timeout.
///
/// [`wait`]: Socket::wait
pub trait Socket {
    /// Sends one datagram, gathered from `buffers` in order, to `address`.
    ///
    /// Returns the number of bytes sent, or `Ok(0)` if the socket cannot
    /// accept the datagram right now (the datagram is dropped, as the
    /// network might have dropped it).
    fn send(&mut self, address: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize>;

    /// Receives one datagram into `buffer`.
    ///
    /// Returns the sender and the datagram length, or `Ok(None)` when no
    /// datagram is waiting. Datagrams longer than `buffer` are truncated.
    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>>;

    /// Blocks until one of the conditions in `condition` holds or
    /// `timeout` elapses, writing the conditions that actually hold back
    /// into `condition`.
    ///
    /// An interrupted wait reports [`WaitCondition::INTERRUPT`] rather
    /// than an error.
    fn wait(&mut self, condition: &mut WaitCondition, timeout: Duration) -> io::Result<()>;

    /// Local address, if the transport has one.
    fn local_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// The default [`Socket`]: a non-blocking [`std::net::UdpSocket`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: std::net::UdpSocket,
    scratch: Vec<u8>,
}

impl UdpTransport {
    /// Binds a UDP socket to `address` and puts it in non-blocking mode.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(address)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            scratch: Vec::new(),
        })
    }

    fn would_block(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }

    /// Resizes the kernel receive and send buffers, for hosts that expect
    /// bursts larger than the system defaults.
    #[cfg(unix)]
    pub fn set_buffer_sizes(&self, receive: usize, send: usize) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let set = |option: libc::c_int, size: usize| {
            let size = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
            let result = unsafe {
                libc::setsockopt(
                    self.socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    option,
                    std::ptr::addr_of!(size).cast(),
                    size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if result == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        };
        set(libc::SO_RCVBUF, receive)?;
        set(libc::SO_SNDBUF, send)
    }
}

impl Socket for UdpTransport {
    fn send(&mut self, address: SocketAddr, buffers: &[&[u8]]) -> io::Result<usize> {
        let datagram: &[u8] = match buffers {
            [single] => single,
            buffers => {
                self.scratch.clear();
                for buffer in buffers {
                    self.scratch.extend_from_slice(buffer);
                }
                &self.scratch
            }
        };
        match self.socket.send_to(datagram, address) {
            Ok(sent) => Ok(sent),
            Err(err) if Self::would_block(&err) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.socket.recv_from(buffer) {
            Ok((received, address)) => Ok(Some((address, received))),
            Err(err) if Self::would_block(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[cfg(unix)]
    fn wait(&mut self, condition: &mut WaitCondition, timeout: Duration) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let mut events = 0i16;
        if condition.contains(WaitCondition::SEND) {
            events |= libc::POLLOUT;
        }
        if condition.contains(WaitCondition::RECEIVE) {
            events |= libc::POLLIN;
        }
        let mut fds = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                *condition = WaitCondition::INTERRUPT;
                return Ok(());
            }
            return Err(err);
        }

        let mut ready_condition = WaitCondition::NONE;
        if fds.revents & libc::POLLOUT != 0 {
            ready_condition = ready_condition.with(WaitCondition::SEND);
        }
        if fds.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
            ready_condition = ready_condition.with(WaitCondition::RECEIVE);
        }
        *condition = ready_condition;
        Ok(())
    }

    #[cfg(not(unix))]
    fn wait(&mut self, condition: &mut WaitCondition, timeout: Duration) -> io::Result<()> {
        // no poll(2); approximate the wait by blocking on a receive peek
        use std::io::ErrorKind;

        if condition.contains(WaitCondition::RECEIVE) {
            self.socket.set_nonblocking(false)?;
            self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            let mut probe = [0u8; 1];
            let result = self.socket.peek_from(&mut probe);
            self.socket.set_nonblocking(true)?;
            *condition = match result {
                Ok(_) => WaitCondition::RECEIVE,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    WaitCondition::NONE
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => WaitCondition::INTERRUPT,
                Err(err) => return Err(err),
            };
        } else {
            std::thread::sleep(timeout);
            *condition = WaitCondition::NONE;
        }
        Ok(())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
