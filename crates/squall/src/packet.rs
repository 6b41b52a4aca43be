//! See [`Packet`].

use bytes::Bytes;

/// Delivery-mode flags attached to a [`Packet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    /// No flags: unreliable, sequenced delivery.
    pub const NONE: Self = Self(0);
    /// Deliver exactly once, in per-channel order, retransmitting until
    /// acknowledged.
    pub const RELIABLE: Self = Self(1 << 0);
    /// Deliver outside all sequencing; late arrivals are not dropped, only
    /// duplicates.
    pub const UNSEQUENCED: Self = Self(1 << 1);
    /// If the packet must be fragmented, keep the fragments unreliable
    /// instead of upgrading the whole message to reliable.
    pub const UNRELIABLE_FRAGMENT: Self = Self(1 << 2);
    /// Set by the transport once the packet has been handed to the wire.
    pub const SENT: Self = Self(1 << 3);

    /// Whether every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// An application message payload.
///
/// The payload is a [`Bytes`], so cloning a packet, splitting it into
/// fragment commands, and handing it to the application all share one
/// reference-counted buffer; the bytes are freed when the last holder goes
/// away. A packet built with [`Packet::from_static`] borrows `'static`
/// memory and never copies or frees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    flags: PacketFlags,
}

impl Packet {
    /// Creates a packet with the given payload and flags.
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// Creates a reliable packet with the given payload.
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Creates an unreliable, sequenced packet with the given payload.
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::NONE)
    }

    /// Creates an unsequenced packet with the given payload.
    pub fn unsequenced(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Creates a packet around static memory, without copying it.
    #[must_use]
    pub const fn from_static(data: &'static [u8], flags: PacketFlags) -> Self {
        Self {
            data: Bytes::from_static(data),
            flags,
        }
    }

    /// Payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Delivery-mode flags.
    #[must_use]
    pub const fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Consumes the packet, returning its shared payload buffer.
    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub(crate) fn share_data(&self) -> Bytes {
        self.data.clone()
    }

    pub(crate) fn mark_sent(&mut self) {
        self.flags = self.flags.with(PacketFlags::SENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let flags = PacketFlags::RELIABLE.with(PacketFlags::UNSEQUENCED);
        assert!(flags.contains(PacketFlags::RELIABLE));
        assert!(flags.contains(PacketFlags::UNSEQUENCED));
        assert!(!flags.contains(PacketFlags::UNRELIABLE_FRAGMENT));
        assert!(PacketFlags::NONE.contains(PacketFlags::NONE));
    }

    #[test]
    fn payload_is_shared() {
        let packet = Packet::reliable(vec![1, 2, 3]);
        let shared = packet.share_data();
        assert_eq!(packet.data(), &shared[..]);
        // same allocation, not a copy
        assert_eq!(packet.data().as_ptr(), shared.as_ptr());
    }

    #[test]
    fn from_static_borrows() {
        static PAYLOAD: [u8; 4] = [9, 9, 9, 9];
        let packet = Packet::from_static(&PAYLOAD, PacketFlags::NONE);
        assert_eq!(PAYLOAD.as_ptr(), packet.data().as_ptr());
    }
}
