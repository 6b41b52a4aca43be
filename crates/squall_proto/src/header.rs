//! See [`DatagramHeader`].

use core::convert::Infallible;

use octs::{BufTooShortOr, Encode, EncodeLen, Read, Write};

use crate::MAXIMUM_PEER_ID;

/// Low 12 bits of the header field: the recipient's peer ID.
pub const HEADER_PEER_ID_MASK: u16 = 0x0FFF;
/// Two session bits above the peer ID.
pub const HEADER_SESSION_MASK: u16 = 0x3000;
/// Shift of the session bits within the header field.
pub const HEADER_SESSION_SHIFT: u16 = 12;
/// Set when the command block of the datagram is compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// Set when the header carries the sender's 16-bit send timestamp.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;

/// Leading fields of every datagram.
///
/// On the wire this is a single big-endian `u16` packing the recipient's
/// 12-bit peer ID (or [`MAXIMUM_PEER_ID`] for "no known peer"), the 2-bit
/// session ID and the [`HEADER_FLAG_COMPRESSED`] / [`HEADER_FLAG_SENT_TIME`]
/// bits, optionally followed by the low 16 bits of the sender's service
/// clock. When a checksum is installed on both ends, a 4-byte checksum slot
/// follows the header; that slot belongs to the endpoints, not this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Recipient's peer ID as assigned by the recipient.
    pub peer_id: u16,
    /// Session ID nibble agreed during the connect exchange (2 bits used).
    pub session_id: u8,
    /// Whether the bytes after the header (and checksum) are compressed.
    pub compressed: bool,
    /// Low 16 bits of the sender's service time, if echoing was requested.
    pub sent_time: Option<u16>,
}

impl DatagramHeader {
    /// Header size without the sent-time field.
    pub const BASE_LEN: usize = 2;
    /// Header size with the sent-time field.
    pub const FULL_LEN: usize = 4;

    /// Decodes a header from the front of a datagram.
    ///
    /// # Errors
    ///
    /// Errors if the buffer ends before the header does.
    pub fn decode(src: &mut impl Read) -> Result<Self, HeaderTooShort> {
        let field = src.read::<u16>().map_err(|_| HeaderTooShort)?;
        let sent_time = if field & HEADER_FLAG_SENT_TIME == 0 {
            None
        } else {
            Some(src.read::<u16>().map_err(|_| HeaderTooShort)?)
        };
        Ok(Self {
            peer_id: field & HEADER_PEER_ID_MASK,
            session_id: ((field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8,
            compressed: field & HEADER_FLAG_COMPRESSED != 0,
            sent_time,
        })
    }

    /// Packs the peer ID, session and flag bits into the leading field.
    #[must_use]
    pub fn field(&self) -> u16 {
        let mut field = self.peer_id & HEADER_PEER_ID_MASK;
        field |= (u16::from(self.session_id) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
        if self.compressed {
            field |= HEADER_FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            field |= HEADER_FLAG_SENT_TIME;
        }
        field
    }
}

/// Datagram ended before its header did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("datagram too short for header")]
pub struct HeaderTooShort;

impl EncodeLen for DatagramHeader {
    fn encode_len(&self) -> usize {
        if self.sent_time.is_some() {
            Self::FULL_LEN
        } else {
            Self::BASE_LEN
        }
    }
}

impl Encode for DatagramHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.field())?;
        if let Some(sent_time) = self.sent_time {
            dst.write(&sent_time)?;
        }
        Ok(())
    }
}

/// Header value addressed to no particular peer, as used by the initial
/// CONNECT datagram.
#[must_use]
pub const fn unknown_peer() -> u16 {
    MAXIMUM_PEER_ID
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use octs::{Bytes, Write};

    use super::*;

    fn round_trip(v: DatagramHeader) -> DatagramHeader {
        let mut buf = BytesMut::new();
        buf.write(&v).unwrap();
        assert_eq!(v.encode_len(), buf.len());
        let mut buf: Bytes = buf.freeze();
        DatagramHeader::decode(&mut buf).unwrap()
    }

    #[test]
    fn encode_decode_bare() {
        let v = DatagramHeader {
            peer_id: 0x123,
            session_id: 2,
            compressed: false,
            sent_time: None,
        };
        assert_eq!(v, round_trip(v));
    }

    #[test]
    fn encode_decode_sent_time() {
        let v = DatagramHeader {
            peer_id: MAXIMUM_PEER_ID,
            session_id: 3,
            compressed: true,
            sent_time: Some(0xABCD),
        };
        assert_eq!(v, round_trip(v));
    }

    #[test]
    fn field_packing() {
        let v = DatagramHeader {
            peer_id: 0xFFF,
            session_id: 3,
            compressed: true,
            sent_time: Some(0),
        };
        assert_eq!(0xFFFF, v.field());

        let v = DatagramHeader {
            peer_id: 0,
            session_id: 0,
            compressed: false,
            sent_time: None,
        };
        assert_eq!(0, v.field());
    }

    #[test]
    fn truncated() {
        let mut buf = Bytes::from_static(&[0x80]);
        assert!(DatagramHeader::decode(&mut buf).is_err());

        // sent-time flag set but no sent-time bytes
        let mut buf = Bytes::from_static(&[0x80, 0x00]);
        assert!(DatagramHeader::decode(&mut buf).is_err());
    }
}
