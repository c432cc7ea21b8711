//! SCION addressing: ISD, ASN, ISD-AS pairs and `IA,host` endpoint
//! addresses as they appear in configuration and on the wire.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};

/// Isolation domain identifier (16 bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Isd(pub u16);

/// AS number (48 bit in SCION).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asn(pub u64);

impl Asn {
    /// Largest representable SCION ASN (48 bit).
    pub const MAX: u64 = (1 << 48) - 1;
    /// ASNs at or below this render in plain decimal (BGP compatibility).
    const MAX_DECIMAL: u64 = u32::MAX as u64;
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 <= Self::MAX_DECIMAL {
            write!(f, "{}", self.0)
        } else {
            write!(
                f,
                "{:x}:{:x}:{:x}",
                (self.0 >> 32) & 0xffff,
                (self.0 >> 16) & 0xffff,
                self.0 & 0xffff
            )
        }
    }
}

impl FromStr for Asn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = if s.contains(':') {
            let mut parts = s.split(':');
            let mut value: u64 = 0;
            for _ in 0..3 {
                let part = parts.next().ok_or_else(|| anyhow!("ASN {s:?} has too few groups"))?;
                let group = u16::from_str_radix(part, 16)
                    .with_context(|| format!("invalid ASN group {part:?}"))?;
                value = value << 16 | u64::from(group);
            }
            if parts.next().is_some() {
                bail!("ASN {s:?} has too many groups");
            }
            value
        } else {
            s.parse::<u64>().with_context(|| format!("invalid decimal ASN {s:?}"))?
        };
        if value > Self::MAX {
            bail!("ASN {s:?} exceeds 48 bits");
        }
        Ok(Asn(value))
    }
}

/// An ISD-AS pair, the administrative-domain half of a SCION address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsdAsn {
    pub isd: Isd,
    pub asn: Asn,
}

impl IsdAsn {
    pub fn new(isd: Isd, asn: Asn) -> Self {
        Self { isd, asn }
    }

    /// Packed 64-bit form used by the daemon API: ISD in the top 16 bits,
    /// ASN in the lower 48.
    pub fn as_u64(&self) -> u64 {
        u64::from(self.isd.0) << 48 | self.asn.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            isd: Isd((value >> 48) as u16),
            asn: Asn(value & Asn::MAX),
        }
    }

    /// A zero ISD or ASN acts as a wildcard in lookups; we never probe one.
    pub fn is_wildcard(&self) -> bool {
        self.isd.0 == 0 || self.asn.0 == 0
    }
}

impl fmt::Display for IsdAsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.isd.0, self.asn)
    }
}

impl FromStr for IsdAsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (isd, asn) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("ISD-AS {s:?} is missing the '-' separator"))?;
        let isd = isd.parse::<u16>().with_context(|| format!("invalid ISD in {s:?}"))?;
        Ok(Self {
            isd: Isd(isd),
            asn: asn.parse()?,
        })
    }
}

/// A full SCION endpoint address in the textual `ISD-AS,host` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    pub ia: IsdAsn,
    pub host: IpAddr,
}

impl ScionAddr {
    pub fn new(ia: IsdAsn, host: IpAddr) -> Self {
        Self { ia, host }
    }
}

impl fmt::Display for ScionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ia, self.host)
    }
}

impl FromStr for ScionAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ia, host) = s
            .split_once(',')
            .ok_or_else(|| anyhow!("SCION address {s:?} is missing the ',' separator"))?;
        // Tolerate bracketed hosts as emitted by some tooling.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self {
            ia: ia.parse()?,
            host: host.parse::<IpAddr>().with_context(|| format!("invalid host in {s:?}"))?,
        })
    }
}
