#![forbid(unsafe_code)]

//! Skein stream layer: authenticated packet flows over UDP carrying
//! hierarchical, independently flow-controlled byte streams and
//! best-effort datagrams.
//!
//! The protocol core is sans-IO and lives in [`host::Host`]; the async
//! shell in [`node::Node`] drives it against a real socket.

pub mod congestion;
pub mod flow;
pub mod host;
pub mod negotiate;
pub mod node;
pub mod peer;
pub mod proto;
pub mod sflow;
pub mod stream;
pub mod xdr;

pub use host::{Event, Host, Transmit};
pub use node::{Listener, Node, Stream};
pub use skein_core::{ArmorKind, Config, CongestionMode, Eid, Error, LinkStatus, Result};
pub use stream::{Shutdown, StreamState};
