use core::{
    num::{NonZero, NonZeroU16},
    time::Duration,
};
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::cfg::{parse_duration, parse_enabled, parse_port, parse_workers, DEFAULT_HOSTNAME};

/// Warm up a freshly started service before it receives real traffic.
///
/// Every option can also be given via the environment, which is how the
/// warmup is usually configured next to the service itself.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Enable warmup.
    ///
    /// Only "true" and "1" enable it.
    #[clap(long, env = "WARMUP_ENABLED", action = ArgAction::Set, value_parser = parse_enabled, default_value = "false")]
    pub enabled: bool,
    /// Hostname of the service.
    #[clap(long, env = "WARMUP_HOSTNAME", default_value = DEFAULT_HOSTNAME)]
    pub hostname: String,
    /// Port the service listens on.
    ///
    /// Required when warmup is enabled.
    #[clap(short, long, env = "PORT", value_parser = parse_port)]
    pub port: Option<NonZeroU16>,
    /// Path to the endpoints file in YAML or JSON format.
    ///
    /// Required when warmup is enabled.
    #[clap(long, env = "WARMUP_ENDPOINTS", value_name = "PATH")]
    pub endpoints: Option<PathBuf>,
    /// Number of warmup workers.
    #[clap(short, long, env = "WARMUP_THREADS", value_parser = parse_workers, default_value = "2")]
    pub threads: NonZero<usize>,
    /// Time, in seconds, during which to warm up the service.
    ///
    /// Measured from the moment warmup is triggered, including the time spent
    /// waiting for the port.
    #[clap(long, env = "WARMUP_TIME_SECONDS", value_parser = parse_duration, default_value = "150")]
    pub time_seconds: Duration,
    /// Time, in seconds, to wait for the port to open.
    ///
    /// If none given (the default) the warmup time is used.
    #[clap(long, env = "WARMUP_PORT_TIMEOUT_SECONDS", value_parser = parse_duration)]
    pub port_timeout_seconds: Option<Duration>,
    /// Timeout, in seconds, of a single warmup request.
    #[clap(long, env = "WARMUP_REQUEST_TIMEOUT_SECONDS", value_parser = parse_duration, default_value = "4")]
    pub request_timeout_seconds: Duration,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}
