//! Broadcast link between the photo cache process and the frame.
//!
//! Two independent transports run in opposite directions: the cache publishes
//! [`StatusSnapshot`]s (and relays screen commands), while the frame side
//! publishes [`Command`]s such as displayed-photo notices. Frames are
//! length-delimited JSON over TCP. Delivery is at-most-once: subscribers that
//! join late only see future messages and nothing is replayed.

mod error;
mod protocol;
mod transport;

pub use error::LinkError;
pub use protocol::{ChannelMessage, Command, ScreenState, StatusSnapshot, WorkerState};
pub use transport::{Publisher, Subscription};
