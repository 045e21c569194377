use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path to a YAML config file overriding the defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Namespace for this queue.
    #[arg(short, long)]
    pub namespace: Option<String>,
    /// Redis connection URL, e.g. redis://127.0.0.1:6379/0.
    #[arg(long)]
    pub redis_url: Option<String>,
    /// Address the HTTP control surface binds to.
    #[arg(long)]
    pub http_addr: Option<SocketAddr>,
    /// Disables the reaper loop.
    #[arg(long, default_value_t)]
    pub no_reaper: bool,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
