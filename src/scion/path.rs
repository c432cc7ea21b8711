//! SCION path metadata and fingerprinting.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::addr::IsdAsn;

/// One inter-AS interface crossed by a path, as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInterface {
    pub ia: IsdAsn,
    pub id: u64,
}

impl fmt::Display for PathInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ia, self.id)
    }
}

/// A concrete end-to-end SCION path: the encoded dataplane path to put on
/// the wire, the underlay next hop for the first link, and the ordered
/// interface sequence from the path metadata.
///
/// The dataplane bytes are opaque to this crate; they are forwarded
/// verbatim between the daemon and the packet encoder.
#[derive(Debug, Clone)]
pub struct Path {
    pub dataplane: Bytes,
    pub underlay: Option<SocketAddr>,
    pub interfaces: Vec<PathInterface>,
}

impl Path {
    /// Number of hops. The interface count is used directly, for both
    /// reporting and shortest-path selection.
    pub fn hop_count(&self) -> usize {
        self.interfaces.len()
    }

    /// An empty path, valid only within the local IA.
    pub fn empty() -> Self {
        Self {
            dataplane: Bytes::new(),
            underlay: None,
            interfaces: Vec::new(),
        }
    }

    /// The rendered interface sequence, e.g. `64-2:0:9#3 71-559#12`.
    /// Recorded in the path_statistics rows for traceability.
    pub fn interfaces_string(&self) -> String {
        self.interfaces
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// SHA-256 digest over a path's rendered interface sequence, in path
/// order. Path identity everywhere in this crate is fingerprint equality;
/// the raw dataplane bytes are never compared.
///
/// The order is deliberate: reversing a path traverses the same interfaces
/// in the opposite sequence and must yield a different fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(path: &Path) -> Self {
        let mut hasher = Sha256::new();
        for iface in &path.interfaces {
            hasher.update(iface.to_string().as_bytes());
        }
        Fingerprint(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    /// Abbreviated form for logs; `Display` renders all 32 bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(isd: u16, asn: u64, id: u64) -> PathInterface {
        use crate::scion::addr::{Asn, Isd};
        PathInterface {
            ia: IsdAsn::new(Isd(isd), Asn(asn)),
            id,
        }
    }

    fn path_with(interfaces: Vec<PathInterface>) -> Path {
        Path {
            dataplane: Bytes::from_static(b"\x00\x00\x00\x00"),
            underlay: None,
            interfaces,
        }
    }

    #[test]
    fn equal_interface_sequences_hash_equal() {
        let a = path_with(vec![iface(1, 10, 2), iface(1, 20, 5)]);
        let mut b = path_with(vec![iface(1, 10, 2), iface(1, 20, 5)]);
        // Different dataplane bytes must not matter.
        b.dataplane = Bytes::from_static(b"\xff\xff");
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn interface_order_matters() {
        let forward = path_with(vec![iface(1, 10, 2), iface(1, 20, 5)]);
        let reverse = path_with(vec![iface(1, 20, 5), iface(1, 10, 2)]);
        assert_ne!(Fingerprint::of(&forward), Fingerprint::of(&reverse));
    }

    #[test]
    fn fingerprint_renders_as_64_hex_chars() {
        let fp = Fingerprint::of(&path_with(vec![iface(1, 10, 2)]));
        let hex = fp.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hop_count_is_interface_count() {
        let p = path_with(vec![iface(1, 10, 2), iface(1, 20, 5), iface(1, 20, 7)]);
        assert_eq!(p.hop_count(), 3);
    }
}
