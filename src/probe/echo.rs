//! Per-destination SCMP echo client.
//!
//! One long-lived UDP underlay socket per destination, multiplexed across
//! concurrent probes by sequence number: `send` registers a one-shot reply
//! sender under the next sequence and returns immediately; a drain task
//! reads the socket continuously (so the kernel buffer never fills between
//! probes) and a dispatch task decodes, classifies and completes at most
//! one pending sender per reply. Registering a new underlay socket per
//! probe — the obvious alternative — exhausts ports under a 100-path
//! sweep, which is exactly what this layout exists to avoid.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::scion::addr::ScionAddr;
use crate::scion::path::Path;
use crate::scion::wire::{self, ScmpMessage, ENDHOST_PORT};

/// Echo payload: the send timestamp, nanoseconds since the epoch,
/// big-endian. The responder mirrors it back, making RTT computation
/// stateless on the receive side.
const PAYLOAD_LEN: usize = 8;

/// Classification of an incoming reply relative to the client's receive
/// ordering, plus the SCMP-error verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// In-order reply (sequence advanced).
    Success,
    /// Same sequence seen twice.
    Duplicate,
    /// The reply took longer than the client timeout.
    AfterTimeout,
    /// Reply for an older in-flight probe; the RTT is still valid.
    OutOfOrder,
    /// A router reported an external interface on the path as down.
    PathDown,
    /// An SCMP error this client has no specific handling for.
    ScmpUnknown,
}

/// Delivered to the probe's reply sender, at most once per probe.
#[derive(Debug, Clone)]
pub struct EchoUpdate {
    pub sequence: u16,
    pub rtt: Duration,
    pub size: usize,
    pub source: ScionAddr,
    pub state: ReplyState,
}

type PendingMap = Arc<Mutex<HashMap<u16, oneshot::Sender<EchoUpdate>>>>;

pub struct EchoClient {
    socket: Arc<UdpSocket>,
    local: ScionAddr,
    identifier: u16,
    sent_sequence: Mutex<u16>,
    pending: PendingMap,
    /// Wedges `send` forever, simulating the stuck-socket failure the
    /// orchestrator's watchdog exists to contain.
    #[cfg(test)]
    pub(crate) stall_sends: std::sync::atomic::AtomicBool,
}

impl EchoClient {
    /// Bind the underlay socket on the local address and start the receive
    /// machinery. The SCMP identifier is the bound port, which is what
    /// routers use to deliver replies in dispatcherless SCION. Returns the
    /// client and the bound port.
    pub async fn new(
        local: ScionAddr,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, u16), ProbeError> {
        let socket = UdpSocket::bind(SocketAddr::new(local.host, 0))
            .await
            .map_err(ProbeError::SocketSetup)?;
        let port = socket.local_addr().map_err(ProbeError::SocketSetup)?.port();
        let socket = Arc::new(socket);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, reply_rx) = mpsc::channel(64);

        let client = Arc::new(Self {
            socket: socket.clone(),
            local,
            identifier: port,
            sent_sequence: Mutex::new(0),
            pending: pending.clone(),
            #[cfg(test)]
            stall_sends: std::sync::atomic::AtomicBool::new(false),
        });

        tokio::spawn(drain_loop(socket, reply_tx, cancel.clone()));
        tokio::spawn(dispatch_loop(reply_rx, pending, port, timeout, cancel));

        Ok((client, port))
    }

    /// Enqueue one echo request to `remote` over `path` and register
    /// `reply` for the answer. Returns the assigned sequence number
    /// without waiting for the reply; the caller owns the probe deadline
    /// and must call [`forget`](Self::forget) when it fires.
    pub async fn send(
        &self,
        remote: &ScionAddr,
        path: Option<&Path>,
        reply: oneshot::Sender<EchoUpdate>,
    ) -> Result<u16, ProbeError> {
        #[cfg(test)]
        if self.stall_sends.load(std::sync::atomic::Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }

        let sequence = {
            let mut seq = self.sent_sequence.lock();
            *seq = seq.wrapping_add(1);
            self.pending.lock().insert(*seq, reply);
            *seq
        };

        let dataplane = path.map(|p| p.dataplane.as_ref()).unwrap_or(&[]);
        if dataplane.is_empty() && remote.ia != self.local.ia {
            self.pending.lock().remove(&sequence);
            return Err(ProbeError::PackFailed(format!(
                "no path to remote IA {} from {}",
                remote.ia, self.local.ia
            )));
        }

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&unix_nanos(SystemTime::now()).to_be_bytes());

        let packet = wire::encode_echo_request(
            &self.local,
            remote,
            dataplane,
            self.identifier,
            sequence,
            &payload,
        )
        .map_err(|e| {
            self.pending.lock().remove(&sequence);
            ProbeError::PackFailed(e.to_string())
        })?;

        // First-hop underlay: the border router from the path metadata,
        // or the endhost port directly for intra-IA destinations.
        let next_hop = path
            .and_then(|p| p.underlay)
            .unwrap_or_else(|| SocketAddr::new(remote.host, ENDHOST_PORT));

        if let Err(e) = self.socket.send_to(&packet, next_hop).await {
            self.pending.lock().remove(&sequence);
            return Err(ProbeError::WriteFailed(e));
        }
        Ok(sequence)
    }

    /// Drop the pending entry for a probe whose deadline expired. The late
    /// reply, if it ever arrives, is discarded by the dispatcher.
    pub fn forget(&self, sequence: u16) {
        self.pending.lock().remove(&sequence);
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Read the underlay socket forever, stamping each datagram with its
/// arrival time. Runs whether or not probes are in flight.
async fn drain_loop(
    socket: Arc<UdpSocket>,
    replies: mpsc::Sender<(Vec<u8>, SystemTime)>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, _from)) => {
                    let datagram = buf[..len].to_vec();
                    if replies.send((datagram, SystemTime::now())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "underlay receive failed");
                }
            },
        }
    }
}

/// Decode, classify and dispatch inbound packets to pending probes.
async fn dispatch_loop(
    mut replies: mpsc::Receiver<(Vec<u8>, SystemTime)>,
    pending: PendingMap,
    identifier: u16,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut last_received: u16 = 0;
    loop {
        let (datagram, received_at) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = replies.recv() => match next {
                Some(reply) => reply,
                None => break,
            },
        };

        let packet = match wire::decode(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "dropping undecodable packet");
                continue;
            }
        };

        match packet.message {
            ScmpMessage::EchoReply {
                identifier: reply_id,
                sequence,
                ref payload,
            } => {
                if reply_id != identifier {
                    debug!(reply_id, "dropping echo reply for another client");
                    continue;
                }
                let rtt = rtt_from_payload(payload, received_at);
                let state = classify(sequence, &mut last_received, rtt, timeout);
                dispatch(
                    &pending,
                    sequence,
                    EchoUpdate {
                        sequence,
                        rtt,
                        size: datagram.len(),
                        source: packet.source,
                        state,
                    },
                );
            }
            ScmpMessage::ExternalInterfaceDown {
                ia,
                interface,
                quoted,
            } => {
                let Some(quoted) = quoted.filter(|q| q.identifier == identifier) else {
                    debug!(%ia, interface, "interface down without a matching quote");
                    continue;
                };
                debug!(%ia, interface, sequence = quoted.sequence, "path signalled down");
                dispatch(
                    &pending,
                    quoted.sequence,
                    EchoUpdate {
                        sequence: quoted.sequence,
                        rtt: Duration::ZERO,
                        size: datagram.len(),
                        source: packet.source,
                        state: ReplyState::PathDown,
                    },
                );
            }
            ScmpMessage::Unknown {
                scmp_type,
                code,
                quoted,
            } => {
                let Some(quoted) = quoted.filter(|q| q.identifier == identifier) else {
                    debug!(scmp_type, code, "dropping unhandled SCMP message");
                    continue;
                };
                dispatch(
                    &pending,
                    quoted.sequence,
                    EchoUpdate {
                        sequence: quoted.sequence,
                        rtt: Duration::ZERO,
                        size: datagram.len(),
                        source: packet.source,
                        state: ReplyState::ScmpUnknown,
                    },
                );
            }
            ScmpMessage::EchoRequest { .. } => {
                // This client only probes; it never answers echoes.
                debug!("dropping inbound echo request");
            }
        }
    }
}

/// Complete the pending probe for `sequence`, if there still is one. The
/// entry is removed first, so a second reply with the same sequence finds
/// nothing to complete.
fn dispatch(pending: &PendingMap, sequence: u16, update: EchoUpdate) {
    let sender = pending.lock().remove(&sequence);
    match sender {
        Some(sender) => {
            // The probe may have timed out between removal and delivery;
            // the receiver being gone is fine.
            let _ = sender.send(update);
        }
        None => debug!(sequence, "no pending probe for reply"),
    }
}

fn classify(sequence: u16, last_received: &mut u16, rtt: Duration, timeout: Duration) -> ReplyState {
    if sequence == *last_received {
        ReplyState::Duplicate
    } else if sequence == last_received.wrapping_add(1) {
        *last_received = sequence;
        ReplyState::Success
    } else if rtt > timeout {
        ReplyState::AfterTimeout
    } else {
        ReplyState::OutOfOrder
    }
}

fn rtt_from_payload(payload: &[u8], received_at: SystemTime) -> Duration {
    let Some(bytes) = payload.get(..PAYLOAD_LEN) else {
        return Duration::ZERO;
    };
    let sent = u64::from_be_bytes(bytes.try_into().unwrap());
    Duration::from_nanos(unix_nanos(received_at).saturating_sub(sent))
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
