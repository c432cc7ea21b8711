//! gRPC client for the SCION daemon (`proto.daemon.v1.DaemonService`).
//!
//! Only the two RPCs this prober needs are declared: `Paths` for path
//! lookups and `AS` for discovering the local ISD-AS. The message types
//! mirror the daemon protobuf definitions; fields we do not consume are
//! simply not declared and are skipped by prost.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::scion::addr::IsdAsn;
use crate::scion::path::{Path, PathInterface};

pub mod proto {
    //! Hand-declared subset of `proto/daemon/v1/daemon.proto`.

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct PathsRequest {
        #[prost(uint64, tag = "1")]
        pub source_isd_as: u64,
        #[prost(uint64, tag = "2")]
        pub destination_isd_as: u64,
        #[prost(bool, tag = "3")]
        pub refresh: bool,
        #[prost(bool, tag = "4")]
        pub hidden: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PathsResponse {
        #[prost(message, repeated, tag = "1")]
        pub paths: ::prost::alloc::vec::Vec<Path>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Path {
        /// Encoded dataplane path, forwarded verbatim into outgoing packets.
        #[prost(bytes = "vec", tag = "1")]
        pub raw: ::prost::alloc::vec::Vec<u8>,
        #[prost(message, optional, tag = "2")]
        pub interface: ::core::option::Option<Interface>,
        #[prost(message, repeated, tag = "3")]
        pub interfaces: ::prost::alloc::vec::Vec<PathInterface>,
        #[prost(uint32, tag = "4")]
        pub mtu: u32,
        #[prost(message, optional, tag = "5")]
        pub expiration: ::core::option::Option<::prost_types::Timestamp>,
    }

    /// The underlay interface over which the path starts.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Interface {
        #[prost(message, optional, tag = "1")]
        pub address: ::core::option::Option<Underlay>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Underlay {
        /// `ip:port` of the border router to send through.
        #[prost(string, tag = "1")]
        pub address: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct PathInterface {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(uint64, tag = "2")]
        pub isd_as: u64,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct AsRequest {
        /// Zero queries the daemon's own AS.
        #[prost(uint64, tag = "1")]
        pub isd_as: u64,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct AsResponse {
        #[prost(uint64, tag = "1")]
        pub isd_as: u64,
        #[prost(bool, tag = "2")]
        pub core: bool,
        #[prost(uint32, tag = "3")]
        pub mtu: u32,
    }
}

pub mod client {
    //! Thin unary client over `tonic::client::Grpc`, shaped like the
    //! output of tonic's code generator.

    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::*;

    use super::proto;

    #[derive(Debug, Clone)]
    pub struct DaemonServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl DaemonServiceClient<tonic::transport::Channel> {
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> DaemonServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        pub async fn paths(
            &mut self,
            request: impl tonic::IntoRequest<proto::PathsRequest>,
        ) -> Result<tonic::Response<proto::PathsResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/proto.daemon.v1.DaemonService/Paths");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("proto.daemon.v1.DaemonService", "Paths"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn r#as(
            &mut self,
            request: impl tonic::IntoRequest<proto::AsRequest>,
        ) -> Result<tonic::Response<proto::AsResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/proto.daemon.v1.DaemonService/AS");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("proto.daemon.v1.DaemonService", "AS"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Convert a daemon path into the engine's path type. Paths without
/// metadata or with an unparseable underlay are rejected so the table only
/// ever holds probeable entries.
pub fn convert_path(p: proto::Path) -> Result<Path> {
    let underlay = match p.interface.and_then(|i| i.address) {
        Some(u) => Some(
            u.address
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid underlay address {:?}", u.address))?,
        ),
        None => None,
    };
    let interfaces = p
        .interfaces
        .iter()
        .map(|i| PathInterface {
            ia: IsdAsn::from_u64(i.isd_as),
            id: i.id,
        })
        .collect();
    Ok(Path {
        dataplane: Bytes::from(p.raw),
        underlay,
        interfaces,
    })
}
