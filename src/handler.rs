//! The handler contract: what to do with fetched pages.

use std::future::Future;

use crate::exchange::Exchange;

/// User-supplied strategy deciding which URLs to fetch and how to process the
/// results.
///
/// One instance is shared by every worker, so implementations must be
/// thread-safe: both hooks run concurrently from all workers. `Q` is the
/// queue type the crawl runs against, letting [`process`](Handler::process)
/// re-queue work in whatever item shape that queue accepts.
pub trait Handler<Q>: Send + Sync + 'static {
    /// Advisory hook invoked directly before each dispatch, including every
    /// redirect hop, so a redirect target can be vetoed. Any request field
    /// may be mutated here; calling [`Exchange::skip`] drops the request
    /// without touching the network.
    fn pre_process(&self, _ex: &mut Exchange) {}

    /// Mandatory post-fetch hook, invoked exactly once per descriptor pulled
    /// from the queue, on success and on error alike. Check
    /// [`Exchange::error`](Exchange) to tell them apart; failed work can be
    /// pushed back through `queue`.
    fn process(&self, ex: Exchange, queue: &Q) -> impl Future<Output = ()> + Send;
}

/// Handler that drops everything on the floor. Useful for one-shot fetches
/// where only the returned [`Exchange`] matters.
pub struct NoopHandler;

impl<Q> Handler<Q> for NoopHandler {
    fn process(&self, _ex: Exchange, _queue: &Q) -> impl Future<Output = ()> + Send {
        async {}
    }
}
