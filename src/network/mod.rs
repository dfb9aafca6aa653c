//! Network subsystem: sockets, discovery and the unicast handshake

pub mod discovery;
pub mod handshake;
pub mod udp;

use std::time::Duration;

/// Shortest period a resend or beacon timer runs at
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

pub use discovery::{PeerRegistry, run_beacon, run_listener};
pub use handshake::{accept_client, connect_to_server};
pub use udp::{bind_ephemeral, bind_multicast, bind_reusable, multicast_sender};
