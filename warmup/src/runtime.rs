use core::{any::Any, num::NonZero};
use std::{
    panic::{self, AssertUnwindSafe},
    thread::Builder,
};

use anyhow::Error;

/// Represents a fixed set of workers, each running in its own error boundary.
///
/// The first worker runs on the calling thread, the rest get a thread each,
/// so exactly `num_workers` threads do the work.
#[derive(Debug)]
pub struct WorkerPool<F> {
    num_workers: NonZero<usize>,
    factory: F,
}

impl<F> WorkerPool<F> {
    pub fn new(num_workers: NonZero<usize>, factory: F) -> Self {
        Self { num_workers, factory }
    }
}

impl<F, U> WorkerPool<F>
where
    F: FnMut(usize) -> U,
    U: FnOnce() -> Result<(), Error> + Send + 'static,
{
    /// Runs this [`WorkerPool`] and waits for all workers to complete.
    ///
    /// Returns the number of workers that failed.
    pub fn run(mut self) -> usize {
        let num_workers = self.num_workers.get();
        let mut threads = Vec::with_capacity(num_workers - 1);
        let mut num_failed = 0;

        let local = (self.factory)(0);
        for idx in 1..num_workers {
            let worker = (self.factory)(idx);
            let thread = Builder::new()
                .name(format!("warmup:w{idx}"))
                .spawn(move || guard(&format!("warmup worker #{idx}"), worker));

            match thread {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    log::error!("failed to spawn warmup worker #{idx}: {err}");
                    num_failed += 1;
                }
            }
        }

        if !guard("warmup worker #0", local) {
            num_failed += 1;
        }

        for thread in threads {
            // Panics are already caught inside.
            if !thread.join().unwrap_or(false) {
                num_failed += 1;
            }
        }

        num_failed
    }
}

/// Runs the given unit of work, catching both errors and panics.
///
/// Nothing escapes: failures are logged and reported as `false`.
pub fn guard<U>(name: &str, work: U) -> bool
where
    U: FnOnce() -> Result<(), Error>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => {
            log::info!("{name} finished successfully");
            true
        }
        Ok(Err(err)) => {
            log::error!("caught error that caused {name} to die: {err:#}");
            log::debug!("{err:?}");
            log::info!("{name} finished with error");
            false
        }
        Err(payload) => {
            log::error!("caught panic that caused {name} to die: {}", panic_message(&*payload));
            log::info!("{name} finished with error");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
