//! Warmup orchestration.
//!
//! A run goes through the following states:
//!
//! ```text
//! IDLE -> WAITING_FOR_PORT -> TIMED_OUT
//!                          -> WARMING -> DONE
//! ```
//!
//! Everything after [`Orchestrator::start`] happens on background threads.
//! The caller may observe the end of the run through [`Completion`], or just
//! forget about it.

use core::{num::NonZero, time::Duration};
use std::{io, sync::Arc, thread::Builder};

use anyhow::Error;
use tokio::{runtime, sync::oneshot, time::Instant};

use crate::{
    cfg::{self, Config},
    port::{PortWaiter, Probe, TcpProbe},
    requester::{self, Requester},
    runtime::{self as pool, WorkerPool},
    transport::{HttpTransport, Transport},
};

/// Used instead of deadlines too far away to be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadlines of both warmup phases.
///
/// Both are measured from orchestration start, so the warmup phase gets
/// whatever is left of its window after the port opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Stop waiting for the port at this point.
    pub port: Instant,
    /// Stop sending warmup requests at this point.
    pub warmup: Instant,
}

impl Deadlines {
    pub fn new(now: Instant, port_timeout: Duration, duration: Duration) -> Self {
        Self {
            port: deadline(now, port_timeout),
            warmup: deadline(now, duration),
        }
    }
}

#[inline]
fn deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// How a warmup run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The port never opened, no requests were sent.
    TimedOut,
    /// All workers are done.
    Finished {
        /// Number of workers that died with an error.
        failed: usize,
    },
    /// The supervisor itself died.
    Aborted,
}

/// Completion notification of a warmup run.
///
/// Dropping it does not affect the run.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<Outcome>);

impl Completion {
    /// Blocks the current thread until the run completes.
    ///
    /// # Panics
    ///
    /// This function panics if called within an asynchronous execution
    /// context, use [`Completion::done`] there.
    pub fn wait(self) -> Outcome {
        self.0.blocking_recv().unwrap_or(Outcome::Aborted)
    }

    /// Waits for the run to complete.
    pub async fn done(self) -> Outcome {
        self.0.await.unwrap_or(Outcome::Aborted)
    }
}

/// Waits for the port to open, then warms the service up with requests from
/// several workers until the deadline.
#[derive(Debug)]
pub struct Orchestrator<T = HttpTransport, P = TcpProbe> {
    waiter: PortWaiter<P>,
    requester: Arc<Requester<T>>,
    workers: NonZero<usize>,
    port_timeout: Duration,
    duration: Duration,
}

impl Orchestrator {
    /// Constructs a new [`Orchestrator`] talking plain HTTP to the configured
    /// service.
    pub fn new(cfg: &Config) -> Result<Self, cfg::Error> {
        let transport = HttpTransport::new(cfg.hostname.clone(), cfg.port, cfg.request_timeout);

        Self::with_parts(cfg, transport, TcpProbe)
    }
}

impl<T, P> Orchestrator<T, P> {
    /// Constructs a new [`Orchestrator`] using the given transport and port
    /// probe.
    pub fn with_parts(cfg: &Config, transport: T, probe: P) -> Result<Self, cfg::Error> {
        let requester = Requester::new(
            &cfg.hostname,
            cfg.port,
            requester::default_headers(),
            cfg.endpoints().to_vec(),
            transport,
        )?;

        let m = Self {
            waiter: PortWaiter::with_probe(cfg.hostname.clone(), cfg.port, probe),
            requester: Arc::new(requester),
            workers: cfg.workers,
            port_timeout: cfg.port_timeout(),
            duration: cfg.duration,
        };

        Ok(m)
    }
}

impl<T, P> Orchestrator<T, P>
where
    T: Transport + Send + Sync + 'static,
    P: Probe + Send + 'static,
{
    /// Starts warmup in the background, returning immediately.
    ///
    /// Deadlines are counted from this call.
    pub fn start(self) -> Result<Completion, io::Error> {
        let deadlines = Deadlines::new(Instant::now(), self.port_timeout, self.duration);
        let (tx, rx) = oneshot::channel();

        Builder::new().name("warmup:s".to_string()).spawn(move || {
            log::debug!("started warmup supervisor");

            let mut outcome = Outcome::Aborted;
            pool::guard("warmup supervisor", || {
                outcome = self.run(deadlines)?;
                Ok(())
            });

            // Nobody may be listening.
            _ = tx.send(outcome);
        })?;

        Ok(Completion(rx))
    }

    fn run(self, deadlines: Deadlines) -> Result<Outcome, Error> {
        let is_open = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(self.waiter.wait(deadlines.port));

        if !is_open {
            log::warn!("port never opened, skipping warmup");
            return Ok(Outcome::TimedOut);
        }

        let requester = self.requester;
        let pool = WorkerPool::new(self.workers, |_idx: usize| {
            let requester = requester.clone();
            move || work(&requester, deadlines.warmup)
        });
        let failed = pool.run();

        log::info!("warmup done, {failed} of {} workers failed", self.workers);

        Ok(Outcome::Finished { failed })
    }
}

/// Runs a single warmup worker on the current thread.
fn work<T>(requester: &Requester<T>, deadline: Instant) -> Result<(), Error>
where
    T: Transport,
{
    runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(warm(requester, deadline))
}

/// Calls the requester until the deadline passes.
///
/// The deadline is checked before each request only, so the last request may
/// complete after it.
pub async fn warm<T>(requester: &Requester<T>, deadline: Instant) -> Result<(), Error>
where
    T: Transport,
{
    let now = Instant::now();
    if now >= deadline {
        log::warn!("warmup deadline already passed, will skip warmup");
        return Ok(());
    }

    log::debug!("starting warmup requests (remaining: {:?})", deadline - now);

    while Instant::now() < deadline {
        requester.call().await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use core::{
        num::NonZeroU16,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use bytes::Bytes;
    use http::{Request, StatusCode};
    use http_body_util::Full;

    use super::*;
    use crate::{cfg::Endpoint, requester::test::RecordingTransport};

    /// Always answers the same.
    #[derive(Debug)]
    struct FixedProbe(bool);

    impl Probe for FixedProbe {
        async fn probe(&self, _hostname: &str, _port: u16) -> Result<(), io::Error> {
            if self.0 {
                Ok(())
            } else {
                Err(io::ErrorKind::ConnectionRefused.into())
            }
        }
    }

    /// Blows up on the first attempt.
    #[derive(Debug)]
    struct PanicProbe;

    impl Probe for PanicProbe {
        async fn probe(&self, _hostname: &str, _port: u16) -> Result<(), io::Error> {
            panic!("probe exploded");
        }
    }

    /// Panics on the very first request, then counts the rest.
    #[derive(Debug, Default)]
    struct PanicOnceTransport {
        panicked: AtomicBool,
        count: AtomicUsize,
    }

    impl Transport for PanicOnceTransport {
        async fn send(&self, _request: Request<Full<Bytes>>) -> Result<StatusCode, Error> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("unexpected failure");
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.count.fetch_add(1, Ordering::SeqCst);

            Ok(StatusCode::OK)
        }
    }

    fn config(paths: &[&str]) -> Config {
        let endpoints = paths.iter().map(|p| Endpoint::get(p).unwrap()).collect();

        Config::new(NonZeroU16::new(8080).unwrap(), endpoints).unwrap()
    }

    fn requester(paths: &[&str], transport: RecordingTransport) -> Requester<RecordingTransport> {
        let cfg = config(paths);

        Requester::new(
            &cfg.hostname,
            cfg.port,
            requester::default_headers(),
            cfg.endpoints().to_vec(),
            transport,
        )
        .unwrap()
    }

    #[test]
    fn test_deadlines() {
        let now = Instant::now();

        let d = Deadlines::new(now, Duration::from_secs(10), Duration::from_secs(150));
        assert_eq!(now + Duration::from_secs(10), d.port);
        assert_eq!(now + Duration::from_secs(150), d.warmup);

        let d = Deadlines::new(now, Duration::MAX, Duration::MAX);
        assert_eq!(now + FAR_FUTURE, d.warmup);
    }

    #[test]
    fn test_port_timeout_defaults_to_duration() {
        let cfg = config(&["/"]).with_duration(Duration::from_secs(30));
        let o = Orchestrator::new(&cfg).unwrap();
        assert_eq!(Duration::from_secs(30), o.port_timeout);

        let cfg = cfg.with_port_timeout(Duration::from_secs(5));
        let o = Orchestrator::new(&cfg).unwrap();
        assert_eq!(Duration::from_secs(5), o.port_timeout);
        assert_eq!(Duration::from_secs(30), o.duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_cycles_until_deadline() {
        // Each request takes one second: calls start at 0s, 1s, 2s and 3s.
        let r = requester(&["/1", "/2", "/3"], RecordingTransport::with_delay(Duration::from_secs(1)));

        warm(&r, Instant::now() + Duration::from_millis(3500)).await.unwrap();

        assert_eq!(vec!["/1", "/2", "/3", "/1"], r.transport().paths());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_past_deadline() {
        let r = requester(&["/1"], RecordingTransport::default());

        warm(&r, Instant::now()).await.unwrap();

        assert!(r.transport().paths().is_empty());
    }

    #[test]
    fn test_start_returns_immediately() {
        let cfg = config(&["/"]).with_duration(Duration::from_millis(300));
        let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(5)));
        let o = Orchestrator::with_parts(&cfg, transport.clone(), FixedProbe(true)).unwrap();

        let now = std::time::Instant::now();
        let completion = o.start().unwrap();
        assert!(now.elapsed() < Duration::from_millis(300));

        assert_eq!(Outcome::Finished { failed: 0 }, completion.wait());
        assert!(now.elapsed() >= Duration::from_millis(300));
        assert!(!transport.paths().is_empty());
    }

    #[test]
    fn test_port_never_opens() {
        let cfg = config(&["/"]).with_port_timeout(Duration::ZERO);
        let transport = Arc::new(RecordingTransport::default());
        let o = Orchestrator::with_parts(&cfg, transport.clone(), FixedProbe(false)).unwrap();

        assert_eq!(Outcome::TimedOut, o.start().unwrap().wait());
        assert!(transport.paths().is_empty());
    }

    #[test]
    fn test_zero_duration() {
        let cfg = config(&["/"]).with_duration(Duration::ZERO).with_workers(NonZero::new(3).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let o = Orchestrator::with_parts(&cfg, transport.clone(), FixedProbe(true)).unwrap();

        assert_eq!(Outcome::Finished { failed: 0 }, o.start().unwrap().wait());
        assert!(transport.paths().is_empty());
    }

    #[test]
    fn test_workers_share_round_robin() {
        let cfg = config(&["/1", "/2"])
            .with_duration(Duration::from_millis(200))
            .with_workers(NonZero::new(3).unwrap());
        let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(5)));
        let o = Orchestrator::with_parts(&cfg, transport.clone(), FixedProbe(true)).unwrap();

        assert_eq!(Outcome::Finished { failed: 0 }, o.start().unwrap().wait());

        let paths = transport.paths();
        let n1 = paths.iter().filter(|p| *p == "/1").count();
        let n2 = paths.iter().filter(|p| *p == "/2").count();
        assert!(n1 > 0);
        assert!(n1.abs_diff(n2) <= 1, "{n1} vs {n2}");
    }

    #[test]
    fn test_worker_failure_is_isolated() {
        let cfg = config(&["/"])
            .with_duration(Duration::from_millis(300))
            .with_workers(NonZero::new(3).unwrap());
        let transport = Arc::new(PanicOnceTransport::default());
        let o = Orchestrator::with_parts(&cfg, transport.clone(), FixedProbe(true)).unwrap();

        assert_eq!(Outcome::Finished { failed: 1 }, o.start().unwrap().wait());
        // The other two workers kept going until the deadline.
        assert!(transport.count.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn test_supervisor_panic_aborts() {
        let cfg = config(&["/"]);
        let transport = Arc::new(RecordingTransport::default());
        let o = Orchestrator::with_parts(&cfg, transport.clone(), PanicProbe).unwrap();

        assert_eq!(Outcome::Aborted, o.start().unwrap().wait());
        assert!(transport.paths().is_empty());
    }

    #[tokio::test]
    async fn test_completion_done() {
        let cfg = config(&["/"]).with_port_timeout(Duration::ZERO);
        let o = Orchestrator::with_parts(&cfg, RecordingTransport::default(), FixedProbe(false)).unwrap();

        assert_eq!(Outcome::TimedOut, o.start().unwrap().done().await);
    }
}
