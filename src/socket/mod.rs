/*! Transport state machines.

The `socket` module provides the per-connection engine: lifecycle states,
the receiver and sender sides of the byte stream, and the congestion
controller. Connections never touch the network or the clock on their own;
the host's poll hands them a device and a timestamp.
*/

mod rudp;

pub(crate) use self::rudp::congestion;
pub(crate) use self::rudp::{ConfirmOutcome, HandshakePoll};
pub use self::rudp::{Connection, State};
