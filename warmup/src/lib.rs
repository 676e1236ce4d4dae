use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    cfg::Config,
    orchestrator::{Completion, Orchestrator},
};

pub mod cfg;
pub mod cmd;
pub mod logging;
pub mod orchestrator;
pub mod port;
pub mod requester;
mod runtime;
pub mod transport;

/// Thread-safe producing iterators.
///
/// Unlike the [`Iterator`] this trait accepts `self` by reference and returns a
/// reference to the next item, not an [`Option`].
///
/// Think of it as an infinite thread-safe iterator.
pub trait Produce {
    /// The type of the elements being produced.
    type Item: ?Sized;

    /// Advances this producer and returns the next value.
    fn next(&self) -> &Self::Item;
}

/// Thread-safe infinite cycle producing iterator over the given vector.
///
/// The position is shared by every caller, so concurrent callers still
/// observe a single global round-robin order.
#[derive(Debug)]
pub struct VecProduce<T> {
    vec: Vec<T>,
    idx: AtomicUsize,
}

impl<T> VecProduce<T> {
    /// Constructs a new [`VecProduce`] from the given non-empty vector.
    #[inline]
    pub const fn new(vec: Vec<T>) -> Self {
        Self { vec, idx: AtomicUsize::new(0) }
    }
}

impl<T> Produce for VecProduce<T> {
    type Item = T;

    #[inline]
    fn next(&self) -> &Self::Item {
        // Increment the current value, returning the previous one.
        let idx = self.idx.fetch_add(1, Ordering::Relaxed);
        let idx = idx % self.vec.len();

        &self.vec[idx]
    }
}

/// Result of [`trigger`].
#[derive(Debug)]
pub enum Trigger {
    /// Warmup is disabled, nothing was started.
    Disabled,
    /// Warmup runs in the background.
    Started(Completion),
}

/// Starts the warmup in the background if it is enabled in the given config.
///
/// Returns immediately, without waiting for the port or any requests.
pub fn trigger(cfg: &Config) -> Result<Trigger, anyhow::Error> {
    if !cfg.enabled {
        log::info!("warmup not enabled, ignoring trigger");
        return Ok(Trigger::Disabled);
    }

    let completion = Orchestrator::new(cfg)?.start()?;

    Ok(Trigger::Started(completion))
}
