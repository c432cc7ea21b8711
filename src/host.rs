//! Connection to the host's local SCION stack.
//!
//! The host context bundles the daemon client, the local ISD-AS and the
//! local IP from which probes are sent. It is constructed once at startup
//! (failure there is fatal) and shared by the prober for per-sweep path
//! lookups (failures there are per-destination warnings).

use std::net::IpAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::info;

use crate::daemon::client::DaemonServiceClient;
use crate::daemon::{convert_path, proto};
use crate::error::PathLookupError;
use crate::scion::addr::IsdAsn;
use crate::scion::path::Path;

pub struct HostContext {
    local_ia: IsdAsn,
    local_ip: IpAddr,
    daemon: Mutex<DaemonServiceClient<Channel>>,
}

impl HostContext {
    /// Connect to the SCION daemon at `daemon_address` (host:port), learn
    /// the local ISD-AS and discover the local source IP.
    pub async fn connect(daemon_address: &str) -> Result<Self> {
        let endpoint = format!("http://{daemon_address}");
        let mut daemon = DaemonServiceClient::connect(endpoint)
            .await
            .with_context(|| format!("unable to connect to the SCION daemon at {daemon_address} (override with SCION_DAEMON_ADDRESS)"))?;

        let response = daemon
            .r#as(proto::AsRequest { isd_as: 0 })
            .await
            .context("AS query against the SCION daemon failed")?;
        let local_ia = IsdAsn::from_u64(response.into_inner().isd_as);

        let local_ip = discover_local_ip(daemon_address)
            .await
            .context("could not determine a local source address")?;

        info!(ia = %local_ia, ip = %local_ip, "SCION host context initialized");
        Ok(Self {
            local_ia,
            local_ip,
            daemon: Mutex::new(daemon),
        })
    }

    /// Host context over a lazy channel that never connects. Path
    /// lookups against it fail, which the sweep path tolerates; used to
    /// drive the orchestrator in tests without a daemon.
    #[cfg(test)]
    pub(crate) fn disconnected(local_ia: IsdAsn, local_ip: IpAddr) -> Self {
        let channel =
            tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        Self {
            local_ia,
            local_ip,
            daemon: Mutex::new(DaemonServiceClient::new(channel)),
        }
    }

    pub fn local_ia(&self) -> IsdAsn {
        self.local_ia
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Query the daemon for paths from the local IA to `dst`.
    pub async fn query_paths(&self, dst: IsdAsn) -> Result<Vec<Path>, PathLookupError> {
        let request = proto::PathsRequest {
            source_isd_as: self.local_ia.as_u64(),
            destination_isd_as: dst.as_u64(),
            refresh: false,
            hidden: false,
        };
        let response = {
            let mut daemon = self.daemon.lock().await;
            daemon.paths(request).await.map_err(|e| PathLookupError {
                destination: dst.to_string(),
                cause: e.into(),
            })?
        };

        let mut paths = Vec::new();
        for p in response.into_inner().paths {
            let path = convert_path(p).map_err(|e| PathLookupError {
                destination: dst.to_string(),
                cause: e,
            })?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Learn the IP the kernel would use to reach the daemon. No packet is
/// sent; connecting a UDP socket just fixes the route.
async fn discover_local_ip(daemon_address: &str) -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(daemon_address).await?;
    Ok(socket.local_addr()?.ip())
}
