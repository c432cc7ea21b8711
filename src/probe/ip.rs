//! Raw-ICMP side pinger for plain IP destinations.
//!
//! Shares nothing with the SCION side except the exporter: one raw ICMPv4
//! socket for all IP destinations, a 16-bit identifier, a monotonic
//! sequence, and a pending map dispatched from a dedicated blocking
//! receiver thread.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{checksum, IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::MutablePacket;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProbeError;

const ICMP_HEADER_SIZE: usize = 8;
/// 8-byte timestamp payload, as on the SCION side.
const PAYLOAD_SIZE: usize = 8;

/// Reply to one IP probe.
#[derive(Debug, Clone)]
pub struct IpUpdate {
    pub sequence: u16,
    pub rtt: Duration,
    pub size: usize,
    pub source: IpAddr,
}

struct PendingProbe {
    sent_at: Instant,
    reply: oneshot::Sender<IpUpdate>,
}

pub struct IpPinger {
    socket: Arc<Socket>,
    identifier: u16,
    sent_sequence: Mutex<u16>,
    pending: Arc<Mutex<HashMap<u16, PendingProbe>>>,
}

impl IpPinger {
    /// Create the shared raw socket and start the receiver thread.
    /// Requires CAP_NET_RAW; the caller decides whether failure is fatal.
    pub fn new(cancel: CancellationToken) -> Result<Arc<Self>, ProbeError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(ProbeError::SocketSetup)?;
        // Short poll so the receiver notices cancellation.
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(ProbeError::SocketSetup)?;
        let socket = Arc::new(socket);

        let pinger = Arc::new(Self {
            socket: socket.clone(),
            identifier: std::process::id() as u16,
            sent_sequence: Mutex::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        });

        spawn_receiver(socket, pinger.pending.clone(), pinger.identifier, cancel);
        Ok(pinger)
    }

    /// Send one echo request to `dest` and register `reply` under the
    /// assigned sequence. Returns the sequence without blocking on the
    /// answer.
    pub fn send(
        &self,
        dest: IpAddr,
        reply: oneshot::Sender<IpUpdate>,
    ) -> Result<u16, ProbeError> {
        let sequence = {
            let mut seq = self.sent_sequence.lock();
            *seq = seq.wrapping_add(1);
            self.pending.lock().insert(
                *seq,
                PendingProbe {
                    sent_at: Instant::now(),
                    reply,
                },
            );
            *seq
        };

        let packet = build_echo_request(self.identifier, sequence);
        let target = SockAddr::from(SocketAddr::new(dest, 0));
        if let Err(e) = self.socket.send_to(&packet, &target) {
            self.pending.lock().remove(&sequence);
            return Err(ProbeError::WriteFailed(e));
        }
        Ok(sequence)
    }

    /// Drop the pending entry for a probe whose deadline expired.
    pub fn forget(&self, sequence: u16) {
        self.pending.lock().remove(&sequence);
    }
}

/// The local address the kernel picks when dialing `dest`; recorded as the
/// source column of ip_ping_results rows.
pub fn local_source_for(dest: IpAddr) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(SocketAddr::new(dest, 443)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + PAYLOAD_SIZE];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        packet.payload_mut()[..8].copy_from_slice(&now.to_be_bytes());
    }

    let cksum = checksum(&IcmpPacket::new(&buffer).unwrap());
    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_checksum(cksum);

    buffer
}

/// Pull (identifier, sequence) out of a raw-socket datagram: IPv4 header,
/// then ICMP echo reply.
fn parse_echo_reply(data: &[u8], our_identifier: u16) -> Option<u16> {
    let ip = Ipv4Packet::new(data)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    let icmp_data = data.get(header_len..)?;
    let icmp = IcmpPacket::new(icmp_data)?;
    if icmp.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let reply = EchoReplyPacket::new(icmp_data)?;
    if reply.get_identifier() != our_identifier {
        return None;
    }
    Some(reply.get_sequence_number())
}

/// Dedicated OS thread for the blocking receive loop; panics are caught so
/// a malformed packet cannot take down the process.
fn spawn_receiver(
    socket: Arc<Socket>,
    pending: Arc<Mutex<HashMap<u16, PendingProbe>>>,
    identifier: u16,
    cancel: CancellationToken,
) {
    std::thread::spawn(move || {
        let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            receive_loop(&socket, &pending, identifier, &cancel)
        }));
        if run.is_err() {
            warn!("IP ping receiver panicked; IP probing stops");
        }
    });
}

fn receive_loop(
    socket: &Socket,
    pending: &Mutex<HashMap<u16, PendingProbe>>,
    identifier: u16,
    cancel: &CancellationToken,
) {
    let mut buffer = [MaybeUninit::<u8>::uninit(); 1500];
    while !cancel.is_cancelled() {
        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "ICMP receive failed");
                continue;
            }
        };
        let source = match from.as_socket() {
            Some(addr) => addr.ip(),
            None => continue,
        };
        // recv_from initialized the first `len` bytes.
        let data: &[u8] =
            unsafe { std::slice::from_raw_parts(buffer.as_ptr() as *const u8, len) };

        let Some(sequence) = parse_echo_reply(data, identifier) else {
            continue;
        };
        let probe = pending.lock().remove(&sequence);
        match probe {
            Some(probe) => {
                let update = IpUpdate {
                    sequence,
                    rtt: probe.sent_at.elapsed(),
                    size: len,
                    source,
                };
                let _ = probe.reply.send(update);
            }
            None => debug!(sequence, %source, "late ICMP reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(0x1234, 7);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + PAYLOAD_SIZE);
        assert_eq!(packet[0], 8); // Echo Request
        assert_eq!(packet[1], 0); // Code
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 7);
        // Checksum must be filled in.
        assert_ne!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn parses_matching_echo_reply() {
        // IPv4 header (20 bytes) + ICMP echo reply.
        let mut packet = vec![0u8; 20 + ICMP_HEADER_SIZE + PAYLOAD_SIZE];
        packet[0] = 0x45;
        packet[9] = 1; // ICMP
        packet[20] = 0; // Echo Reply
        packet[24..26].copy_from_slice(&0x1234u16.to_be_bytes());
        packet[26..28].copy_from_slice(&9u16.to_be_bytes());

        assert_eq!(parse_echo_reply(&packet, 0x1234), Some(9));
        assert_eq!(parse_echo_reply(&packet, 0x9999), None);
    }

    #[test]
    fn ignores_non_reply_types() {
        let mut packet = vec![0u8; 20 + ICMP_HEADER_SIZE];
        packet[0] = 0x45;
        packet[9] = 1;
        packet[20] = 8; // Echo Request, not a reply
        assert_eq!(parse_echo_reply(&packet, 0x1234), None);
    }
}
