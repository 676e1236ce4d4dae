use core::{num::NonZeroU16, time::Duration};
use std::{io, sync::Arc};

use tokio::{net::TcpStream, time::Instant};

/// Pause between two consecutive connection attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum time a single connection attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Single port availability check.
#[allow(async_fn_in_trait)]
pub trait Probe {
    /// Tries to establish a connection once, closing it immediately.
    async fn probe(&self, hostname: &str, port: u16) -> Result<(), io::Error>;
}

impl<P> Probe for Arc<P>
where
    P: Probe + ?Sized,
{
    #[inline]
    async fn probe(&self, hostname: &str, port: u16) -> Result<(), io::Error> {
        (**self).probe(hostname, port).await
    }
}

/// Checks the port by opening a TCP connection to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    async fn probe(&self, hostname: &str, port: u16) -> Result<(), io::Error> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((hostname, port))).await {
            Ok(stream) => stream?,
            Err(..) => return Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out")),
        };
        drop(stream);

        Ok(())
    }
}

/// Waits for the given port to become available.
#[derive(Debug)]
pub struct PortWaiter<P = TcpProbe> {
    hostname: String,
    port: NonZeroU16,
    probe: P,
}

impl PortWaiter {
    /// Constructs a new [`PortWaiter`] that probes using TCP connections.
    pub fn new(hostname: impl Into<String>, port: NonZeroU16) -> Self {
        Self::with_probe(hostname, port, TcpProbe)
    }
}

impl<P> PortWaiter<P> {
    /// Constructs a new [`PortWaiter`] using the given probe.
    pub fn with_probe(hostname: impl Into<String>, port: NonZeroU16, probe: P) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            probe,
        }
    }
}

impl<P> PortWaiter<P>
where
    P: Probe,
{
    /// Polls the port until it accepts a connection or the deadline passes.
    ///
    /// Returns `true` as soon as a connection succeeds. The port is always
    /// probed at least once, even if the deadline has already passed.
    pub async fn wait(&self, deadline: Instant) -> bool {
        log::debug!("waiting for {}:{} to be available", self.hostname, self.port);

        loop {
            match self.probe.probe(&self.hostname, self.port.get()).await {
                Ok(()) => {
                    log::debug!("service at {}:{} is up", self.hostname, self.port);
                    return true;
                }
                Err(err) => {
                    log::debug!("{}:{} is not available yet: {err}", self.hostname, self.port);
                }
            }

            if Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}
