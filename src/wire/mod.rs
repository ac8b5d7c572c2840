/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   [Packet] structure.
 * Second, it provides a compact, high-level representation of packet data
   that can be parsed from and emitted into a sequence of octets. This
   happens through the [Repr] struct.

The `Packet::new_checked` method is a shorthand for a combination of
`Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input, it is *necessary* to use `Packet::new_checked()`; so long as the
buffer is not modified, no accessor will fail. When emitting output, the
buffer length is the caller's responsibility: `Repr::buffer_len()` gives the
exact number of octets `Repr::emit()` will touch.

[Packet]: struct.Packet.html
[Repr]: struct.Repr.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod rudp;
mod seq;

pub use self::rudp::{
    Kind as PacketKind, Packet, Repr, HEADER_LEN, MAX_SACKS, MAX_SEGMENT_SIZE, SACK_RANGE_LEN,
};
pub use self::seq::{SeqNumber, SeqRange};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
