//! Probe clients: the per-destination SCMP echo client and the raw-ICMP
//! side pinger.

pub mod echo;
pub mod ip;

pub use echo::{EchoClient, EchoUpdate, ReplyState};
pub use ip::{IpPinger, IpUpdate};
