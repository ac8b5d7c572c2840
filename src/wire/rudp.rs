use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, Result, SeqNumber, SeqRange};
use crate::phy::MAX_PACKET_SIZE;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = field::ACK.end;

/// Size of one selective-acknowledgment entry.
pub const SACK_RANGE_LEN: usize = 8;

/// Maximum number of selective-acknowledgment entries in one packet.
pub const MAX_SACKS: usize = 8;

/// Maximum payload of a packet whose header carries no SACK entries.
///
/// This is the segment size every congestion-window computation uses.
pub const MAX_SEGMENT_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// The type byte carried in every header.
///
/// Purely informational: dispatch looks at the destination port only, and
/// a receiver must accept any value here. `Reset` exists on the wire but is
/// never produced by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Connect,
    Accept,
    Reset,
    Ack,
    Ping,
    Data,
    Unknown(u8),
}

impl From<u8> for Kind {
    fn from(value: u8) -> Kind {
        match value {
            0 => Kind::Connect,
            1 => Kind::Accept,
            2 => Kind::Reset,
            3 => Kind::Ack,
            4 => Kind::Ping,
            5 => Kind::Data,
            other => Kind::Unknown(other),
        }
    }
}

impl From<Kind> for u8 {
    fn from(value: Kind) -> u8 {
        match value {
            Kind::Connect => 0,
            Kind::Accept => 1,
            Kind::Reset => 2,
            Kind::Ack => 3,
            Kind::Ping => 4,
            Kind::Data => 5,
            Kind::Unknown(other) => other,
        }
    }
}

/// A read/write wrapper around a transport packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const TYPE: usize = 0;
    pub const SACKS: usize = 1;
    pub const RESERVED: Field = 2..4;
    pub const SRC_PORT: Field = 4..6;
    pub const DST_PORT: Field = 6..8;
    pub const SEQ: Field = 8..12;
    pub const ACK: Field = 12..16;

    pub const fn SACK_RANGE(index: usize) -> Field {
        let start = ACK.end + index * super::SACK_RANGE_LEN;
        start..start + super::SACK_RANGE_LEN
    }

    pub const fn PAYLOAD(sacks: usize) -> Rest {
        SACK_RANGE(sacks).start..
    }
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the fixed header,
    /// if the SACK count exceeds [MAX_SACKS], or if the SACK table is
    /// truncated.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let sacks = self.sack_count() as usize;
        if sacks > MAX_SACKS {
            return Err(Error);
        }
        if len < field::PAYLOAD(sacks).start {
            return Err(Error);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the type field.
    #[inline]
    pub fn kind(&self) -> Kind {
        let data = self.buffer.as_ref();
        Kind::from(data[field::TYPE])
    }

    /// Return the number of SACK entries.
    #[inline]
    pub fn sack_count(&self) -> u8 {
        let data = self.buffer.as_ref();
        data[field::SACKS]
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field. Zero flags a CONNECT.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number of the first payload byte.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::SEQ]))
    }

    /// Return the cumulative acknowledgment (next expected byte).
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::ACK]))
    }

    /// Return the SACK entry at `index`.
    ///
    /// # Panics
    /// Panics if `index` is not below the SACK count of a checked packet.
    #[inline]
    pub fn sack_range(&self, index: usize) -> SeqRange {
        let data = self.buffer.as_ref();
        let entry = &data[field::SACK_RANGE(index)];
        SeqRange {
            start: SeqNumber(NetworkEndian::read_u32(&entry[0..4])),
            size: NetworkEndian::read_u32(&entry[4..8]),
        }
    }

    /// Return the length of the header, including the SACK table.
    pub fn header_len(&self) -> usize {
        field::PAYLOAD(self.sack_count() as usize).start
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let sacks = self.sack_count() as usize;
        let data = self.buffer.as_ref();
        &data[field::PAYLOAD(sacks)]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the type field.
    #[inline]
    pub fn set_kind(&mut self, value: Kind) {
        let data = self.buffer.as_mut();
        data[field::TYPE] = value.into();
    }

    /// Set the SACK entry count.
    #[inline]
    pub fn set_sack_count(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::SACKS] = value;
    }

    /// Zero the reserved field.
    #[inline]
    pub fn clear_reserved(&mut self) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::RESERVED], 0);
    }

    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value);
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value);
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ], value.0);
    }

    /// Set the acknowledgment field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK], value.0);
    }

    /// Write the SACK entry at `index`.
    #[inline]
    pub fn set_sack_range(&mut self, index: usize, value: SeqRange) {
        let data = self.buffer.as_mut();
        let entry = &mut data[field::SACK_RANGE(index)];
        NetworkEndian::write_u32(&mut entry[0..4], value.start.0);
        NetworkEndian::write_u32(&mut entry[4..8], value.size);
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let sacks = self.sack_count() as usize;
        let data = self.buffer.as_mut();
        &mut data[field::PAYLOAD(sacks)]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A high-level representation of a transport packet header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Repr {
    pub kind: Kind,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub sacks: heapless::Vec<SeqRange, MAX_SACKS>,
}

impl Repr {
    /// Parse a transport packet and return a high-level representation.
    pub fn parse<T>(packet: &Packet<&T>) -> Result<Repr>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;

        let mut sacks = heapless::Vec::new();
        for index in 0..packet.sack_count() as usize {
            // cannot overflow, check_len bounds the count by the capacity
            let _ = sacks.push(packet.sack_range(index));
        }

        Ok(Repr {
            kind: packet.kind(),
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            sacks,
        })
    }

    /// Return the length of the header that will be emitted from this
    /// high-level representation.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + self.sacks.len() * SACK_RANGE_LEN
    }

    /// Return the total buffer length needed for this header plus
    /// `payload_len` octets of payload.
    pub fn buffer_len(&self, payload_len: usize) -> usize {
        self.header_len() + payload_len
    }

    /// Emit a high-level representation into a transport packet.
    ///
    /// The payload area is left untouched; use [`Packet::payload_mut`]
    /// after emission.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]>,
    {
        packet.set_kind(self.kind);
        packet.set_sack_count(self.sacks.len() as u8);
        packet.clear_reserved();
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number);
        for (index, sack) in self.sacks.iter().enumerate() {
            packet.set_sack_range(index, *sack);
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match Repr::parse(self) {
            Ok(repr) => write!(f, "{repr}"),
            Err(err) => write!(f, "rudp ({err})"),
        }
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "rudp {:?} src={} dst={} seq={} ack={} sacks={}",
            self.kind,
            self.src_port,
            self.dst_port,
            self.seq_number,
            self.ack_number,
            self.sacks.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 32] = [
        0x05, 0x01, 0x00, 0x00, 0x30, 0x39, 0xd4, 0x31, 0xff, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x00,
        0x2a, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22,
        0x33, 0x44,
    ];

    static PAYLOAD_BYTES: [u8; 8] = [0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22, 0x33, 0x44];

    fn packet_repr() -> Repr {
        let mut sacks = heapless::Vec::new();
        sacks
            .push(SeqRange::new(SeqNumber(0x100), 0x200))
            .unwrap();
        Repr {
            kind: Kind::Data,
            src_port: 12345,
            dst_port: 54321,
            seq_number: SeqNumber(0xffff_fffe),
            ack_number: SeqNumber(42),
            sacks,
        }
    }

    #[test]
    fn deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.kind(), Kind::Data);
        assert_eq!(packet.sack_count(), 1);
        assert_eq!(packet.src_port(), 12345);
        assert_eq!(packet.dst_port(), 54321);
        assert_eq!(packet.seq_number(), SeqNumber(0xffff_fffe));
        assert_eq!(packet.ack_number(), SeqNumber(42));
        assert_eq!(packet.sack_range(0), SeqRange::new(SeqNumber(0x100), 0x200));
        assert_eq!(packet.header_len(), HEADER_LEN + SACK_RANGE_LEN);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn construct() {
        let repr = packet_repr();
        let mut bytes = vec![0xa5; repr.buffer_len(PAYLOAD_BYTES.len())];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&*packet.into_inner(), &PACKET_BYTES[..]);
    }

    #[test]
    fn parse_emit_roundtrip() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr, packet_repr());

        let mut bytes = vec![0; repr.buffer_len(PAYLOAD_BYTES.len())];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn full_sack_table() {
        let mut sacks = heapless::Vec::new();
        for i in 0..MAX_SACKS as u32 {
            sacks
                .push(SeqRange::new(SeqNumber(i * 0x1000), 0x100))
                .unwrap();
        }
        let repr = Repr {
            kind: Kind::Ack,
            src_port: 1,
            dst_port: 2,
            seq_number: SeqNumber(0),
            ack_number: SeqNumber(0),
            sacks,
        };
        assert_eq!(repr.header_len(), HEADER_LEN + MAX_SACKS * SACK_RANGE_LEN);

        let mut bytes = vec![0; repr.buffer_len(0)];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        let parsed = Repr::parse(&Packet::new_checked(&bytes[..]).unwrap()).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn truncated_header_rejected() {
        assert_eq!(
            Packet::new_checked(&PACKET_BYTES[..HEADER_LEN - 1]).err(),
            Some(Error)
        );
    }

    #[test]
    fn truncated_sack_table_rejected() {
        // one SACK entry announced, three bytes of it missing
        assert_eq!(
            Packet::new_checked(&PACKET_BYTES[..HEADER_LEN + 5]).err(),
            Some(Error)
        );
    }

    #[test]
    fn oversized_sack_count_rejected() {
        let mut bytes = PACKET_BYTES;
        bytes[1] = MAX_SACKS as u8 + 1;
        assert_eq!(Packet::new_checked(&bytes[..]).err(), Some(Error));
    }
}
