//! A distributed-ready, multi-threaded web crawling framework.
//!
//! The framework does not decide what to fetch or what to do with the
//! results: it provides the concurrent fetch engine sitting between a
//! pluggable work source (a [`CrawlQueue`]) and a pluggable result sink (a
//! [`Handler`]). Embed it, register a handler, point it at a queue, and
//! launch N workers through a [`Controller`].
//!
//! Under the hood the engine keeps live HTTP(S) connections reusable across
//! workers in a per-endpoint pool with LRU eviction, follows redirects with a
//! bounded hop budget, and transparently decodes gzip response bodies,
//! tolerating the malformed trailing bytes some servers append.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crawle::{Controller, CrawlQueue, Exchange, Handler, UrlQueue};
//!
//! struct StatusHandler;
//!
//! impl Handler<UrlQueue> for StatusHandler {
//!     async fn process(&self, ex: Exchange, queue: &UrlQueue) {
//!         match (&ex.error, ex.response_status) {
//!             (None, Some(status)) => println!("{} {}", status, ex.request_url),
//!             // put failed work back on the queue
//!             _ => queue.put(ex.request_url.clone()).await,
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Arc::new(UrlQueue::new());
//!     queue.push("http://example.com/");
//!     let mut controller = Controller::new(StatusHandler, queue, 4);
//!     controller.start();
//!     controller.join().await;
//! }
//! ```

pub mod control;
pub mod controller;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod handler;
mod pool;
pub mod queue;
mod transport;
mod worker;

pub use self::{
    control::{quick_request, ConnectionControl, ControlConfig, DEFAULT_SOCKET_TIMEOUT},
    controller::{Controller, StopFlag, EMPTY_QUEUE_RETRIES},
    driver::{run_crawl, CrawlArgs},
    error::{BoxError, CrawlError, ErrorKind},
    exchange::{Exchange, DEFAULT_REDIRECTS},
    handler::{Handler, NoopHandler},
    queue::{CrawlQueue, UrlQueue},
    worker::EMPTY_QUEUE_WAIT,
};
