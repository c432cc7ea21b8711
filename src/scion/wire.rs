//! SCION packet encoding and decoding for SCMP echo traffic.
//!
//! The underlay is plain UDP (dispatcherless SCION): a SCION packet is the
//! UDP datagram payload, laid out as common header, address header,
//! dataplane path, then the L4 protocol (here always SCMP).
//!
//! Only the small slice of SCMP this prober needs is modeled: echo
//! request/reply, the external-interface-down error (including digging the
//! probe sequence out of the quoted packet), and a catch-all for anything
//! else.

use std::net::IpAddr;

use thiserror::Error;

use super::addr::{IsdAsn, ScionAddr};

/// SCMP protocol number in the SCION common header.
pub const SCMP_PROTOCOL: u8 = 202;
/// UDP port on which SCION endhosts receive dispatcherless traffic.
pub const ENDHOST_PORT: u16 = 30041;

const HEADER_VERSION: u8 = 0;
const PATH_TYPE_EMPTY: u8 = 0;
const PATH_TYPE_SCION: u8 = 1;
const COMMON_HDR_LEN: usize = 12;

const SCMP_EXTERNAL_INTERFACE_DOWN: u8 = 5;
const SCMP_ECHO_REQUEST: u8 = 128;
const SCMP_ECHO_REPLY: u8 = 129;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("packet truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unsupported SCION header version {0}")]
    BadVersion(u8),

    #[error("not an SCMP packet (next header {0})")]
    NotScmp(u8),

    #[error("unsupported host address length {0}")]
    BadHostLength(usize),

    #[error("dataplane path length {0} is not a multiple of 4")]
    BadPathLength(usize),

    #[error("SCMP checksum mismatch")]
    ChecksumMismatch,
}

/// The SCMP messages this prober reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScmpMessage {
    EchoRequest {
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    },
    EchoReply {
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    },
    /// A router signalled that an external interface on the path is down.
    /// `quoted` carries the identifier/sequence of our echo request if it
    /// could be recovered from the quoted packet.
    ExternalInterfaceDown {
        ia: IsdAsn,
        interface: u64,
        quoted: Option<QuotedEcho>,
    },
    /// Any SCMP type the prober has no specific handling for. For error
    /// class messages the quoted echo request is still recovered when
    /// possible so the verdict can reach the pending probe.
    Unknown {
        scmp_type: u8,
        code: u8,
        quoted: Option<QuotedEcho>,
    },
}

/// Identifier and sequence of an echo request quoted inside an SCMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedEcho {
    pub identifier: u16,
    pub sequence: u16,
}

/// A decoded inbound SCION/SCMP packet.
#[derive(Debug, Clone)]
pub struct ScmpPacket {
    pub source: ScionAddr,
    pub destination: ScionAddr,
    pub message: ScmpMessage,
}

/// Encode an SCMP echo request from `local` to `remote` over the given
/// dataplane path (empty slice for intra-IA traffic).
pub fn encode_echo_request(
    local: &ScionAddr,
    remote: &ScionAddr,
    dataplane: &[u8],
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let scmp = build_echo(SCMP_ECHO_REQUEST, identifier, sequence, payload);
    encode_scmp_packet(local, remote, dataplane, &scmp)
}

/// Encode an SCMP echo reply. The prober itself never answers echoes; this
/// is the other half of the codec, exercised by the loopback tests.
pub fn encode_echo_reply(
    local: &ScionAddr,
    remote: &ScionAddr,
    dataplane: &[u8],
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let scmp = build_echo(SCMP_ECHO_REPLY, identifier, sequence, payload);
    encode_scmp_packet(local, remote, dataplane, &scmp)
}

fn build_echo(scmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut scmp = Vec::with_capacity(8 + payload.len());
    scmp.push(scmp_type);
    scmp.push(0); // code
    scmp.extend_from_slice(&[0, 0]); // checksum, patched during encoding
    scmp.extend_from_slice(&identifier.to_be_bytes());
    scmp.extend_from_slice(&sequence.to_be_bytes());
    scmp.extend_from_slice(payload);
    scmp
}

/// Assemble a full SCION packet around an SCMP message, computing the
/// pseudo-header checksum into bytes 2..4 of the SCMP layer.
pub(crate) fn encode_scmp_packet(
    local: &ScionAddr,
    remote: &ScionAddr,
    dataplane: &[u8],
    scmp: &[u8],
) -> Result<Vec<u8>, WireError> {
    if dataplane.len() % 4 != 0 {
        return Err(WireError::BadPathLength(dataplane.len()));
    }

    let dst_host = host_bytes(&remote.host);
    let src_host = host_bytes(&local.host);
    let addr_hdr_len = 16 + dst_host.len() + src_host.len();
    let hdr_len = COMMON_HDR_LEN + addr_hdr_len + dataplane.len();

    let mut buf = Vec::with_capacity(hdr_len + scmp.len());

    // Common header: version(4) | traffic class(8) | flow id(20).
    let ver_tc_flow: u32 = (u32::from(HEADER_VERSION) << 28) | 1;
    buf.extend_from_slice(&ver_tc_flow.to_be_bytes());
    buf.push(SCMP_PROTOCOL);
    buf.push((hdr_len / 4) as u8);
    buf.extend_from_slice(&(scmp.len() as u16).to_be_bytes());
    buf.push(if dataplane.is_empty() {
        PATH_TYPE_EMPTY
    } else {
        PATH_TYPE_SCION
    });
    // DT(2) DL(2) ST(2) SL(2): type 0 = IP, length code = bytes/4 - 1.
    let dl = (dst_host.len() / 4 - 1) as u8;
    let sl = (src_host.len() / 4 - 1) as u8;
    buf.push(dl << 4 | sl);
    buf.extend_from_slice(&[0, 0]); // reserved

    // Address header: destination first.
    buf.extend_from_slice(&remote.ia.as_u64().to_be_bytes());
    buf.extend_from_slice(&local.ia.as_u64().to_be_bytes());
    buf.extend_from_slice(&dst_host);
    buf.extend_from_slice(&src_host);

    buf.extend_from_slice(dataplane);

    let l4_offset = buf.len();
    buf.extend_from_slice(scmp);

    let checksum = scmp_checksum(
        &buf[COMMON_HDR_LEN..COMMON_HDR_LEN + addr_hdr_len],
        &buf[l4_offset..],
    );
    buf[l4_offset + 2..l4_offset + 4].copy_from_slice(&checksum.to_be_bytes());

    Ok(buf)
}

fn host_bytes(host: &IpAddr) -> Vec<u8> {
    match host {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

fn host_from_bytes(bytes: &[u8]) -> Result<IpAddr, WireError> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        other => Err(WireError::BadHostLength(other)),
    }
}

/// SCMP upper-layer checksum: ones-complement sum over the SCION
/// pseudo-header (the address header, the L4 length and the protocol
/// number) followed by the SCMP message with its checksum field zeroed.
fn scmp_checksum(addr_hdr: &[u8], scmp: &[u8]) -> u16 {
    fn add_words(sum: &mut u32, data: &[u8], skip_checksum_at: Option<usize>) {
        let mut i = 0;
        while i + 1 < data.len() {
            if skip_checksum_at != Some(i) {
                *sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
            }
            i += 2;
        }
        if i < data.len() {
            *sum += u32::from(data[i]) << 8;
        }
    }

    let mut sum: u32 = 0;
    add_words(&mut sum, addr_hdr, None);
    let len = scmp.len() as u32;
    sum += len >> 16;
    sum += len & 0xffff;
    sum += u32::from(SCMP_PROTOCOL);
    add_words(&mut sum, scmp, Some(2));

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    let checksum = !(sum as u16);
    // All-zero is transmitted as all-one, as in UDP.
    if checksum == 0 {
        0xffff
    } else {
        checksum
    }
}

/// Decode an inbound UDP datagram as a SCION/SCMP packet.
pub fn decode(buf: &[u8]) -> Result<ScmpPacket, WireError> {
    if buf.len() < COMMON_HDR_LEN {
        return Err(WireError::Truncated(buf.len()));
    }
    let version = buf[0] >> 4;
    if version != HEADER_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let next_hdr = buf[4];
    if next_hdr != SCMP_PROTOCOL {
        return Err(WireError::NotScmp(next_hdr));
    }
    let hdr_len = usize::from(buf[5]) * 4;
    let payload_len = usize::from(u16::from_be_bytes([buf[6], buf[7]]));
    if buf.len() < hdr_len + payload_len {
        return Err(WireError::Truncated(buf.len()));
    }

    let dst_host_len = (usize::from(buf[9] >> 4 & 0x3) + 1) * 4;
    let src_host_len = (usize::from(buf[9] & 0x3) + 1) * 4;
    let addr_hdr_len = 16 + dst_host_len + src_host_len;
    if hdr_len < COMMON_HDR_LEN + addr_hdr_len {
        return Err(WireError::Truncated(buf.len()));
    }

    let dst_ia = IsdAsn::from_u64(u64::from_be_bytes(buf[12..20].try_into().unwrap()));
    let src_ia = IsdAsn::from_u64(u64::from_be_bytes(buf[20..28].try_into().unwrap()));
    let hosts = &buf[28..28 + dst_host_len + src_host_len];
    let dst_host = host_from_bytes(&hosts[..dst_host_len])?;
    let src_host = host_from_bytes(&hosts[dst_host_len..])?;

    let l4 = &buf[hdr_len..hdr_len + payload_len];
    if l4.len() < 4 {
        return Err(WireError::Truncated(l4.len()));
    }
    let addr_hdr = &buf[COMMON_HDR_LEN..COMMON_HDR_LEN + addr_hdr_len];
    let received = u16::from_be_bytes([l4[2], l4[3]]);
    if scmp_checksum(addr_hdr, l4) != received {
        return Err(WireError::ChecksumMismatch);
    }

    let message = parse_scmp(l4)?;
    Ok(ScmpPacket {
        source: ScionAddr::new(src_ia, src_host),
        destination: ScionAddr::new(dst_ia, dst_host),
        message,
    })
}

fn parse_scmp(l4: &[u8]) -> Result<ScmpMessage, WireError> {
    let scmp_type = l4[0];
    let code = l4[1];
    match scmp_type {
        SCMP_ECHO_REQUEST | SCMP_ECHO_REPLY => {
            if l4.len() < 8 {
                return Err(WireError::Truncated(l4.len()));
            }
            let identifier = u16::from_be_bytes([l4[4], l4[5]]);
            let sequence = u16::from_be_bytes([l4[6], l4[7]]);
            let payload = l4[8..].to_vec();
            Ok(if scmp_type == SCMP_ECHO_REQUEST {
                ScmpMessage::EchoRequest {
                    identifier,
                    sequence,
                    payload,
                }
            } else {
                ScmpMessage::EchoReply {
                    identifier,
                    sequence,
                    payload,
                }
            })
        }
        SCMP_EXTERNAL_INTERFACE_DOWN => {
            if l4.len() < 20 {
                return Err(WireError::Truncated(l4.len()));
            }
            let ia = IsdAsn::from_u64(u64::from_be_bytes(l4[4..12].try_into().unwrap()));
            let interface = u64::from_be_bytes(l4[12..20].try_into().unwrap());
            Ok(ScmpMessage::ExternalInterfaceDown {
                ia,
                interface,
                quoted: quoted_echo(&l4[20..]),
            })
        }
        _ => {
            // Offset of the quoted packet differs per error type: the
            // unreachable/too-big/parameter-problem family has a 4-byte
            // type-specific field, internal-connectivity-down carries
            // IA + ingress + egress identifiers first.
            let quoted = match scmp_type {
                1 | 2 | 4 => l4.get(8..).and_then(quoted_echo),
                6 => l4.get(28..).and_then(quoted_echo),
                _ => None,
            };
            Ok(ScmpMessage::Unknown {
                scmp_type,
                code,
                quoted,
            })
        }
    }
}

/// Recover identifier/sequence from the echo request quoted inside an SCMP
/// error, so the error can be routed to the pending probe. Routers may
/// truncate the quote, in which case correlation falls back to the probe
/// timeout.
fn quoted_echo(quoted: &[u8]) -> Option<QuotedEcho> {
    if quoted.len() < COMMON_HDR_LEN || quoted[4] != SCMP_PROTOCOL {
        return None;
    }
    let hdr_len = usize::from(quoted[5]) * 4;
    let l4 = quoted.get(hdr_len..)?;
    if l4.len() < 8 || l4[0] != SCMP_ECHO_REQUEST {
        return None;
    }
    Some(QuotedEcho {
        identifier: u16::from_be_bytes([l4[4], l4[5]]),
        sequence: u16::from_be_bytes([l4[6], l4[7]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> ScionAddr {
        "64-2:0:9,192.0.2.1".parse().unwrap()
    }

    fn remote() -> ScionAddr {
        "71-559,198.51.100.7".parse().unwrap()
    }

    /// A minimal 4-byte-aligned stand-in for an encoded dataplane path.
    const PATH: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn echo_request_round_trip() {
        let payload = 1_700_000_000_000_000_000u64.to_be_bytes();
        let pkt = encode_echo_request(&local(), &remote(), PATH, 40001, 7, &payload).unwrap();

        let decoded = decode(&pkt).unwrap();
        assert_eq!(decoded.source, local());
        assert_eq!(decoded.destination, remote());
        assert_eq!(
            decoded.message,
            ScmpMessage::EchoRequest {
                identifier: 40001,
                sequence: 7,
                payload: payload.to_vec(),
            }
        );
    }

    #[test]
    fn echo_reply_round_trip_with_empty_path() {
        let pkt = encode_echo_reply(&remote(), &local(), &[], 40001, 7, b"12345678").unwrap();
        let decoded = decode(&pkt).unwrap();
        match decoded.message {
            ScmpMessage::EchoReply {
                identifier,
                sequence,
                ..
            } => {
                assert_eq!(identifier, 40001);
                assert_eq!(sequence, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn corrupted_packet_fails_checksum() {
        let mut pkt = encode_echo_request(&local(), &remote(), PATH, 1, 1, b"\0\0\0\0\0\0\0\0").unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xff;
        assert!(matches!(decode(&pkt), Err(WireError::ChecksumMismatch)));
    }

    #[test]
    fn rejects_non_scmp_next_header() {
        let mut pkt = encode_echo_request(&local(), &remote(), PATH, 1, 1, b"\0\0\0\0\0\0\0\0").unwrap();
        pkt[4] = 17; // UDP
        assert!(matches!(decode(&pkt), Err(WireError::NotScmp(17))));
    }

    #[test]
    fn rejects_unaligned_path() {
        let err = encode_echo_request(&local(), &remote(), &[0u8; 6], 1, 1, b"").unwrap_err();
        assert!(matches!(err, WireError::BadPathLength(6)));
    }

    #[test]
    fn interface_down_correlates_quoted_request() {
        // The packet the router complains about.
        let request =
            encode_echo_request(&local(), &remote(), PATH, 40001, 9, b"\0\0\0\0\0\0\0\0").unwrap();

        // Router-originated error: IA + interface id + quoted packet.
        let mut scmp = vec![SCMP_EXTERNAL_INTERFACE_DOWN, 0, 0, 0];
        let router_ia: IsdAsn = "64-2:0:9".parse().unwrap();
        scmp.extend_from_slice(&router_ia.as_u64().to_be_bytes());
        scmp.extend_from_slice(&42u64.to_be_bytes());
        scmp.extend_from_slice(&request);
        let pkt = encode_scmp_packet(&remote(), &local(), &[], &scmp).unwrap();

        let decoded = decode(&pkt).unwrap();
        match decoded.message {
            ScmpMessage::ExternalInterfaceDown {
                ia,
                interface,
                quoted,
            } => {
                assert_eq!(ia, router_ia);
                assert_eq!(interface, 42);
                assert_eq!(
                    quoted,
                    Some(QuotedEcho {
                        identifier: 40001,
                        sequence: 9,
                    })
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn truncated_quote_degrades_gracefully() {
        let mut scmp = vec![SCMP_EXTERNAL_INTERFACE_DOWN, 0, 0, 0];
        scmp.extend_from_slice(&1u64.to_be_bytes());
        scmp.extend_from_slice(&2u64.to_be_bytes());
        scmp.extend_from_slice(&[0u8; 6]); // not enough for a common header
        let pkt = encode_scmp_packet(&remote(), &local(), &[], &scmp).unwrap();

        match decode(&pkt).unwrap().message {
            ScmpMessage::ExternalInterfaceDown { quoted, .. } => assert_eq!(quoted, None),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_preserved() {
        let scmp = vec![6u8, 1, 0, 0, 0, 0, 0, 0];
        let pkt = encode_scmp_packet(&remote(), &local(), &[], &scmp).unwrap();
        assert_eq!(
            decode(&pkt).unwrap().message,
            ScmpMessage::Unknown {
                scmp_type: 6,
                code: 1,
                quoted: None,
            }
        );
    }

    #[test]
    fn unknown_error_recovers_quote_when_present() {
        let request =
            encode_echo_request(&local(), &remote(), PATH, 40001, 3, b"\0\0\0\0\0\0\0\0").unwrap();
        // Destination unreachable: 4-byte unused field, then the quote.
        let mut scmp = vec![1u8, 0, 0, 0, 0, 0, 0, 0];
        scmp.extend_from_slice(&request);
        let pkt = encode_scmp_packet(&remote(), &local(), &[], &scmp).unwrap();

        match decode(&pkt).unwrap().message {
            ScmpMessage::Unknown {
                scmp_type, quoted, ..
            } => {
                assert_eq!(scmp_type, 1);
                assert_eq!(
                    quoted,
                    Some(QuotedEcho {
                        identifier: 40001,
                        sequence: 3,
                    })
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ipv6_hosts_encode_and_decode() {
        let a: ScionAddr = "19-ffaa:0:1303,[2001:db8::1]".parse().unwrap();
        let b: ScionAddr = "19-ffaa:0:1304,[2001:db8::2]".parse().unwrap();
        let pkt = encode_echo_request(&a, &b, &[], 5, 6, b"\0\0\0\0\0\0\0\0").unwrap();
        let decoded = decode(&pkt).unwrap();
        assert_eq!(decoded.source, a);
        assert_eq!(decoded.destination, b);
    }
}
