//! The worker loop: pull descriptors, drive the pipeline, hand results to the
//! handler.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{
    control::ConnectionControl, controller::StopFlag, handler::Handler, queue::CrawlQueue,
};

/// Default time a worker parks on an empty queue before burning a retry.
pub const EMPTY_QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Broadcast latch used by workers to nudge each other whenever a fetch
/// completes, since its processing may have enqueued new work.
///
/// Built on a watch channel: a worker marks the current version seen *before*
/// polling the queue, so a wake racing the empty observation is caught by the
/// subsequent `changed()` instead of being lost.
#[derive(Clone)]
pub(crate) struct IdleWake {
    tx: Arc<watch::Sender<()>>,
}

impl IdleWake {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(()).0),
        }
    }

    /// Wake every parked worker.
    pub fn notify(&self) {
        self.tx.send_replace(());
    }

    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

/// A single unit of execution. Workers share the connection control, the
/// handler, the queue and the stop flag; everything else is per-worker.
pub(crate) struct Worker<H, Q> {
    control: Arc<ConnectionControl>,
    handler: Arc<H>,
    queue: Arc<Q>,
    stop: StopFlag,
    wake: IdleWake,
    empty_queue_wait: Duration,
    empty_queue_retries: u32,
}

impl<H, Q> Worker<H, Q>
where
    H: Handler<Q>,
    Q: CrawlQueue,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<ConnectionControl>,
        handler: Arc<H>,
        queue: Arc<Q>,
        stop: StopFlag,
        wake: IdleWake,
        empty_queue_wait: Duration,
        empty_queue_retries: u32,
    ) -> Self {
        Self {
            control,
            handler,
            queue,
            stop,
            wake,
            empty_queue_wait,
            empty_queue_retries,
        }
    }

    /// Drive the worker until the stop flag latches or the queue stays dry
    /// past the retry budget.
    pub async fn run(self) {
        let mut wake_rx = self.wake.subscribe();
        let mut retry_count = 0u32;
        while !self.stop.is_set() {
            // Mark the current wake version seen before polling the queue.
            wake_rx.borrow_and_update();
            let item = match self.queue.get().await {
                Ok(item) => item,
                Err(err) => {
                    if !self.stop.is_set() {
                        tracing::error!("queue error, stopping the crawl: {err}");
                        self.stop.set();
                    } else {
                        tracing::error!("queue error: {err}");
                    }
                    break;
                }
            };
            let Some(mut ex) = item else {
                match tokio::time::timeout(self.empty_queue_wait, wake_rx.changed()).await {
                    // Another worker produced work; try the queue again.
                    Ok(Ok(())) => continue,
                    // The wake channel is gone; nothing can produce work.
                    Ok(Err(_)) => break,
                    Err(_elapsed) => {
                        if retry_count < self.empty_queue_retries {
                            retry_count += 1;
                            continue;
                        }
                        if !self.stop.is_set() {
                            tracing::info!("queue empty, stopping the crawl");
                            self.stop.set();
                        }
                        break;
                    }
                }
            };
            retry_count = 0;
            if let Err(err) = self.control.fetch(&mut ex, self.handler.as_ref()).await {
                ex.error = Some(err);
            }
            // The handler runs on success and on error alike; it decides
            // whether failed work goes back on the queue.
            self.handler.process(ex, self.queue.as_ref()).await;
            self.wake.notify();
        }
    }
}
