//! Worker-pool lifecycle: fan-out, join and graceful stop.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    control::{ConnectionControl, ControlConfig, DEFAULT_SOCKET_TIMEOUT},
    handler::Handler,
    queue::CrawlQueue,
    worker::{IdleWake, Worker, EMPTY_QUEUE_WAIT},
};

/// Default number of extra empty-queue rounds a worker sits through before
/// declaring the crawl finished.
pub const EMPTY_QUEUE_RETRIES: u32 = 1;

/// Latched cancellation signal shared by a controller, its workers and the
/// pipeline.
///
/// Scoped to one controller run rather than global state, so independent
/// controllers can coexist in one process. Once set it stays set for the
/// lifetime of the run.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The primary controller: owns the worker pool and its lifecycle.
///
/// All workers share one [`ConnectionControl`] (and thus one endpoint LRU),
/// one handler instance, one queue and one stop flag.
pub struct Controller<H, Q> {
    handler: Arc<H>,
    queue: Arc<Q>,
    config: ControlConfig,
    stop: StopFlag,
    wake: IdleWake,
    num_workers: usize,
    empty_queue_wait: Duration,
    empty_queue_retries: u32,
    workers: Vec<JoinHandle<()>>,
}

impl<H, Q> Controller<H, Q>
where
    H: Handler<Q>,
    Q: CrawlQueue,
{
    /// Create a controller driving `num_workers` workers with the default
    /// socket timeout.
    pub fn new(handler: H, queue: Arc<Q>, num_workers: usize) -> Self {
        Self::with_timeout(handler, queue, num_workers, DEFAULT_SOCKET_TIMEOUT)
    }

    /// Create a controller with an explicit per-socket timeout.
    ///
    /// Connection-pool bounds derive from the process file-descriptor soft
    /// limit: `max_endpoints = nofiles * 2 / (num_workers * 3)` with
    /// `num_workers` idle connections per endpoint, capping steady-state idle
    /// sockets at roughly two thirds of the limit with headroom left for
    /// in-flight ones.
    pub fn with_timeout(
        handler: H,
        queue: Arc<Q>,
        num_workers: usize,
        timeout: Duration,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let config = ControlConfig {
            max_endpoints: Some(endpoint_budget(nofile_limit(), num_workers)),
            max_conn: Some(num_workers),
            request_limit: None,
            timeout: Some(timeout),
        };
        Self {
            handler: Arc::new(handler),
            queue,
            config,
            stop: StopFlag::new(),
            wake: IdleWake::new(),
            num_workers,
            empty_queue_wait: EMPTY_QUEUE_WAIT,
            empty_queue_retries: EMPTY_QUEUE_RETRIES,
            workers: Vec::new(),
        }
    }

    /// Override how long workers park on an empty queue before burning a
    /// retry. Takes effect for workers launched after the call.
    pub fn set_empty_queue_wait(&mut self, wait: Duration) -> &mut Self {
        self.empty_queue_wait = wait;
        self
    }

    /// Override how many empty-queue rounds a worker retries before stopping
    /// the crawl.
    pub fn set_empty_queue_retries(&mut self, retries: u32) -> &mut Self {
        self.empty_queue_retries = retries;
        self
    }

    /// Force connections to be reset after `limit` requests, defending
    /// against server-side keep-alive limits. `None` (the default) never
    /// resets.
    pub fn set_request_limit(&mut self, limit: Option<u32>) -> &mut Self {
        self.config.request_limit = limit;
        self
    }

    /// The stop flag of this run, for wiring into external signal handling.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Launch all workers.
    pub fn start(&mut self) {
        let control = Arc::new(ConnectionControl::new(
            self.config.clone(),
            self.stop.clone(),
        ));
        for _ in 0..self.num_workers {
            let worker = Worker::new(
                Arc::clone(&control),
                Arc::clone(&self.handler),
                Arc::clone(&self.queue),
                self.stop.clone(),
                self.wake.clone(),
                self.empty_queue_wait,
                self.empty_queue_retries,
            );
            self.workers.push(tokio::spawn(worker.run()));
        }
        tracing::info!("started {} workers", self.num_workers);
    }

    /// Wait for every worker to finish, logging progress along the way.
    pub async fn join(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        let total = workers.len();
        let mut count = 0usize;
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!("worker task failed: {err}");
            }
            count += 1;
            tracing::info!("{count}/{total} workers closed");
        }
    }

    /// Latch the stop flag and wait for in-flight requests to drain.
    /// Idempotent.
    pub async fn stop(&mut self) {
        self.stop.set();
        tracing::info!("stop received");
        self.join().await;
    }

    /// Whether the crawl has come to a stop.
    pub fn crawl_finished(&self) -> bool {
        self.stop.is_set()
    }
}

/// `max_endpoints` heuristic from the file-descriptor budget.
fn endpoint_budget(nofiles: u64, num_workers: usize) -> usize {
    let budget = nofiles.saturating_mul(2) / (num_workers as u64 * 3);
    budget.max(1) as usize
}

#[cfg(unix)]
fn nofile_limit() -> u64 {
    use nix::sys::resource::{getrlimit, Resource};

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => soft,
        Err(err) => {
            tracing::warn!("could not read RLIMIT_NOFILE, assuming 1024: {err}");
            1024
        }
    }
}

#[cfg(not(unix))]
fn nofile_limit() -> u64 {
    1024
}

#[cfg(test)]
mod controller_tests {
    use super::{endpoint_budget, StopFlag};

    #[test]
    fn stop_flag_latches() {
        let stop = StopFlag::new();
        assert!(!stop.is_set());
        stop.set();
        assert!(stop.is_set());
        // independent flags do not interfere
        assert!(!StopFlag::new().is_set());
    }

    #[test]
    fn endpoint_budget_follows_fd_limit() {
        assert_eq!(endpoint_budget(1024, 4), 170);
        assert_eq!(endpoint_budget(1024, 1), 682);
        // never sized to zero, even under absurd worker counts
        assert_eq!(endpoint_budget(8, 1024), 1);
    }
}
