use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "bm2d", version, about = "bm2 supervision daemon")]
pub struct Args {
    /// Daemon home directory (socket, pid file, logs, dump). Defaults to $HOME/.bm2.
    #[arg(long = "home")]
    pub home: Option<PathBuf>,

    /// Resource sampling interval in milliseconds.
    #[arg(long = "monitor-interval-ms", default_value_t = 1000)]
    pub monitor_interval_ms: u64,

    /// Print build info and exit.
    #[arg(long = "build-info")]
    pub build_info: bool,
}
