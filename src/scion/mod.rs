//! SCION addressing, path metadata and the SCMP wire codec.

pub mod addr;
pub mod path;
pub mod wire;

pub use addr::{Asn, Isd, IsdAsn, ScionAddr};
pub use path::{Fingerprint, Path, PathInterface};
