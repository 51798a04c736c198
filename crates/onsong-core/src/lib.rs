//! onsong-core: shared protocol library for the OnSong bridge.
//!
//! Provides the JSON wire messages spoken between the relay and its agents,
//! the text codec, the request correlator that multiplexes many outstanding
//! calls over one socket, and a keyed timer table used for debouncing.

pub mod codec;
pub mod correlator;
pub mod error;
pub mod messages;
pub mod timers;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Inbound};
pub use correlator::{Correlator, RequestIds, DEFAULT_TIMEOUT};
pub use error::{BridgeError, BridgeResult};
pub use messages::{Message, RequestId};
pub use timers::KeyedTimers;

/// Protocol version reported by agents in `register.proxyVersion`.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
