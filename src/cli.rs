use clap::Parser;

/// Continuous SCION multi-path reachability and latency prober
#[derive(Parser, Debug, Clone)]
#[command(name = "scion-multiping")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Space-separated SCION destinations ("ISD-AS,host ISD-AS,host ...").
    /// Ignored when the remotes file exists; it takes precedence.
    pub destinations: Option<String>,
}
