//! The work-queue contract and the reference URL queue.

use std::{
    collections::VecDeque,
    fs::File,
    future::Future,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
    time::Instant,
};

use parking_lot::Mutex;

use crate::{error::BoxError, exchange::Exchange};

/// Work source the workers poll.
///
/// `get` is semantically non-blocking: when no work is currently available it
/// must return `Ok(None)` (the empty sentinel) rather than wait. Returning
/// `Err` signals catastrophic failure and latches the crawl's stop flag.
///
/// `put` round-trips whatever item shape the handler chooses; the engine
/// never looks at it. Implementations may be local, remote or distributed.
pub trait CrawlQueue: Send + Sync + 'static {
    /// Shape of the items handlers enqueue.
    type Item: Send;

    /// Pull the next descriptor, or `None` if nothing is available right now.
    fn get(&self) -> impl Future<Output = Result<Option<Exchange>, BoxError>> + Send;

    /// Enqueue an item.
    fn put(&self, item: Self::Item) -> impl Future<Output = ()> + Send;
}

/// Log queue throughput after this many items.
const LOG_AFTER: u64 = 1000;

/// The most basic queue type, sufficient for most crawls: an unbounded FIFO
/// of full URLs with throughput logging.
pub struct UrlQueue {
    inner: Mutex<UrlQueueInner>,
}

struct UrlQueueInner {
    items: VecDeque<String>,
    total_items: u64,
    start_time: Option<Instant>,
    block_time: Option<Instant>,
}

impl UrlQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UrlQueueInner {
                items: VecDeque::new(),
                total_items: 0,
                start_time: None,
                block_time: None,
            }),
        }
    }

    /// Create a queue seeded from a file of one URL per line and/or a list
    /// of URLs.
    pub fn with_seed(seed_file: Option<&Path>, seed_urls: &[String]) -> io::Result<Self> {
        let queue = Self::new();
        {
            let mut inner = queue.inner.lock();
            if let Some(path) = seed_file {
                let file = File::open(path)?;
                let mut count = 0usize;
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    let url = line.trim();
                    if !url.is_empty() {
                        inner.items.push_back(url.to_owned());
                        count += 1;
                    }
                }
                tracing::info!("queued {count} urls from seed file");
            }
            for url in seed_urls {
                inner.items.push_back(url.clone());
            }
            if !seed_urls.is_empty() {
                tracing::info!("queued {} urls from seed list", seed_urls.len());
            }
            if inner.items.is_empty() {
                tracing::info!("starting with an empty queue");
            }
        }
        Ok(queue)
    }

    /// Append a URL to the queue.
    pub fn push(&self, url: impl Into<String>) {
        self.inner.lock().items.push_back(url.into());
    }

    /// Number of URLs currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the remaining queue to `path`, one URL per line, and return how
    /// many were written. Falls back to stdout when the file cannot be
    /// created.
    pub fn save(&self, path: &Path) -> usize {
        let items = std::mem::take(&mut self.inner.lock().items);
        let count = items.len();
        match File::create(path) {
            Ok(file) => {
                let mut file = BufWriter::new(file);
                for url in &items {
                    let _ = writeln!(file, "{url}");
                }
                let _ = file.flush();
            }
            Err(err) => {
                tracing::warn!("could not open save file, dumping to stdout: {err}");
                for url in &items {
                    println!("{url}");
                }
            }
        }
        tracing::info!("saved {count} urls");
        count
    }
}

impl Default for UrlQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlQueue for UrlQueue {
    type Item = String;

    async fn get(&self) -> Result<Option<Exchange>, BoxError> {
        let mut inner = self.inner.lock();
        let Some(url) = inner.items.pop_front() else {
            return Ok(None);
        };
        inner.total_items += 1;
        let now = Instant::now();
        match inner.start_time {
            None => {
                inner.start_time = Some(now);
                inner.block_time = Some(now);
            }
            Some(start) => {
                if inner.total_items % LOG_AFTER == 0 {
                    let block = inner.block_time.unwrap_or(start);
                    let rps_now = LOG_AFTER as f64 / (now - block).as_secs_f64();
                    let rps_avg = inner.total_items as f64 / (now - start).as_secs_f64();
                    tracing::info!(
                        "crawled: {} remaining: {} rps: {rps_now:.2} ({rps_avg:.2} avg)",
                        inner.total_items,
                        inner.items.len(),
                    );
                    inner.block_time = Some(now);
                }
            }
        }
        Ok(Some(Exchange::new(url)))
    }

    async fn put(&self, item: String) {
        self.push(item);
    }
}
