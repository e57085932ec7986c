#![forbid(unsafe_code)]

//! Shared foundation for the skein transport: identifier types,
//! configuration, error handling, and the backoff timer used by the
//! retransmission and reconnection machinery.

pub mod config;
pub mod error;
pub mod timer;
pub mod types;

pub use config::{ArmorKind, Config, CongestionMode};
pub use error::{Error, Result};
pub use timer::BackoffTimer;
pub use types::{Channel, Eid, FlowHandle, LinkStatus, SocketHandle, StreamHandle, StreamId};
