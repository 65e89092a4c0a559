//! Per-endpoint connection pooling with least-recently-used eviction.
//!
//! Connections are keyed by resolved address, not hostname, so distinct
//! hostnames sharing an address share connections. Each endpoint owns a
//! bounded FIFO of idle connections; the set of endpoints itself is bounded
//! and evicts the least recently *released* endpoint, destroying its idle
//! connections. Pools are created on release, never on acquire, so a burst of
//! hosts that all fail to connect does not churn the LRU.

use std::{collections::VecDeque, net::IpAddr};

use ahash::AHashMap;
use parking_lot::Mutex;

/// A pooled transport must be able to report whether it is still usable.
pub(crate) trait Poolable: Send + 'static {
    fn is_open(&self) -> bool;
}

/// Key under which connections are pooled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub tls: bool,
}

/// A transport annotated with the number of requests it has served.
pub(crate) struct Conn<T> {
    pub transport: T,
    pub use_count: u32,
}

impl<T> Conn<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            use_count: 0,
        }
    }
}

/// FIFO of idle connections for a single endpoint.
///
/// Not separately synchronized: every access goes through the owning
/// [`EndpointLru`]'s mutex.
struct ConnQueue<T> {
    idle: VecDeque<Conn<T>>,
    max_conn: Option<usize>,
    request_limit: Option<u32>,
}

impl<T: Poolable> ConnQueue<T> {
    fn new(max_conn: Option<usize>, request_limit: Option<u32>) -> Self {
        Self {
            idle: VecDeque::new(),
            max_conn,
            request_limit,
        }
    }

    /// Pop an idle connection without blocking. A popped connection past its
    /// request limit or no longer open is closed instead and `None` is
    /// returned, leaving the caller to dial a replacement.
    fn acquire(&mut self) -> Option<Conn<T>> {
        let conn = self.idle.pop_front()?;
        if let Some(limit) = self.request_limit {
            if conn.use_count >= limit {
                tracing::trace!("resetting connection past its request limit");
                return None;
            }
        }
        if !conn.transport.is_open() {
            tracing::trace!("dropping dead idle connection");
            return None;
        }
        Some(conn)
    }

    /// Return a connection after a successful request. The projected size is
    /// compared against the capacity once, so the bound is exact.
    fn release(&mut self, mut conn: Conn<T>) {
        conn.use_count += 1;
        match self.max_conn {
            Some(max) if self.idle.len() + 1 > max => {
                tracing::trace!("idle queue full, closing connection");
            }
            _ => self.idle.push_back(conn),
        }
    }

    /// Drop every idle connection. The queue is dead afterwards.
    fn destroy(&mut self) {
        self.idle.clear();
    }

    fn len(&self) -> usize {
        self.idle.len()
    }
}

struct Node<T> {
    key: Endpoint,
    queue: ConnQueue<T>,
    /// Towards the most recently used end.
    prev: Option<usize>,
    /// Towards the least recently used end.
    next: Option<usize>,
}

struct LruInner<T> {
    table: AHashMap<Endpoint, usize>,
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

/// Thread-safe mapping from [`Endpoint`] to its idle-connection queue,
/// bounded by `max_endpoints` with LRU eviction.
///
/// A single mutex covers the hash table and all list pointers; every
/// structural operation holds it for its entire duration.
pub(crate) struct EndpointLru<T> {
    inner: Mutex<LruInner<T>>,
    max_endpoints: Option<usize>,
    max_conn: Option<usize>,
    request_limit: Option<u32>,
}

impl<T: Poolable> EndpointLru<T> {
    pub fn new(
        max_endpoints: Option<usize>,
        max_conn: Option<usize>,
        request_limit: Option<u32>,
    ) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                table: AHashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
            max_endpoints,
            max_conn,
            request_limit,
        }
    }

    /// Take an idle connection for `key` if one is pooled. Pools are born on
    /// release, so a miss means the caller dials fresh.
    pub fn acquire(&self, key: &Endpoint) -> Option<Conn<T>> {
        let mut inner = self.inner.lock();
        let idx = *inner.table.get(key)?;
        inner.node_mut(idx).queue.acquire()
    }

    /// Return `conn` to the pool for `key` after a successful request,
    /// marking the endpoint most recently used. If the endpoint is not yet
    /// tracked, the least recently used endpoints are evicted until there is
    /// room, then a fresh queue is linked in.
    pub fn release(&self, key: Endpoint, conn: Conn<T>) {
        let mut inner = self.inner.lock();
        let existing = inner.table.get(&key).copied();
        if let Some(idx) = existing {
            inner.move_to_head(idx);
            inner.node_mut(idx).queue.release(conn);
            return;
        }
        if let Some(max) = self.max_endpoints {
            while inner.table.len() + 1 > max {
                if !inner.evict_tail() {
                    break;
                }
            }
        }
        let idx = inner.insert_at_head(key, ConnQueue::new(self.max_conn, self.request_limit));
        inner.node_mut(idx).queue.release(conn);
    }
}

impl<T: Poolable> LruInner<T> {
    fn node_mut(&mut self, idx: usize) -> &mut Node<T> {
        self.nodes[idx].as_mut().expect("stale node handle")
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node_mut(idx);
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    fn attach_head(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(old_head) = old_head {
            self.node_mut(old_head).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.attach_head(idx);
    }

    fn insert_at_head(&mut self, key: Endpoint, queue: ConnQueue<T>) -> usize {
        let node = Node {
            key,
            queue,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.attach_head(idx);
        self.table.insert(key, idx);
        idx
    }

    /// Unlink and destroy the least recently used endpoint. Returns `false`
    /// when the list is already empty.
    fn evict_tail(&mut self) -> bool {
        let Some(idx) = self.tail else {
            return false;
        };
        self.detach(idx);
        let node = self.nodes[idx].take().expect("stale tail handle");
        self.free.push(idx);
        self.table.remove(&node.key);
        tracing::debug!(endpoint = ?node.key, idle = node.queue.len(), "evicting endpoint");
        let mut queue = node.queue;
        queue.destroy();
        true
    }
}

#[cfg(test)]
impl<T: Poolable> EndpointLru<T> {
    fn endpoint_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    fn idle_count(&self, key: &Endpoint) -> usize {
        let mut inner = self.inner.lock();
        match inner.table.get(key).copied() {
            Some(idx) => inner.node_mut(idx).queue.len(),
            None => 0,
        }
    }

    /// Keys from most to least recently used.
    fn keys_mru_first(&self) -> Vec<Endpoint> {
        let mut inner = self.inner.lock();
        let mut keys = Vec::new();
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let node = inner.node_mut(idx);
            keys.push(node.key);
            cursor = node.next;
        }
        keys
    }
}

#[cfg(test)]
mod pool_tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::{Conn, Endpoint, EndpointLru, Poolable};

    /// Transport stand-in that counts how many instances were dropped, i.e.
    /// how many connections were closed.
    struct FakeConn {
        open: bool,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConn {
        fn new(closed: &Arc<AtomicUsize>) -> Self {
            Self {
                open: true,
                closed: Arc::clone(closed),
            }
        }
    }

    impl Poolable for FakeConn {
        fn is_open(&self) -> bool {
            self.open
        }
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn endpoint(n: u8) -> Endpoint {
        Endpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)),
            port: 80,
            tls: false,
        }
    }

    #[test]
    fn acquire_miss_returns_none() {
        let lru: EndpointLru<FakeConn> = EndpointLru::new(None, None, None);
        assert!(lru.acquire(&endpoint(1)).is_none());
        // pools are born on release only
        assert_eq!(lru.endpoint_count(), 0);
    }

    #[test]
    fn release_then_acquire_roundtrip() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(None, None, None);
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.endpoint_count(), 1);

        let conn = lru.acquire(&endpoint(1)).expect("pooled connection");
        assert_eq!(conn.use_count, 1);
        assert_eq!(lru.idle_count(&endpoint(1)), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_limit_resets_connection() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(None, None, Some(1));
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        // use_count is now 1, which is at the limit
        assert!(lru.acquire(&endpoint(1)).is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handed_out_connections_stay_under_limit() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(None, None, Some(3));
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        let conn = lru.acquire(&endpoint(1)).expect("still under the limit");
        assert!(conn.use_count < 3);
    }

    #[test]
    fn dead_connections_are_not_reused() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(None, None, None);
        let mut conn = FakeConn::new(&closed);
        conn.open = false;
        lru.release(endpoint(1), Conn::new(conn));
        assert!(lru.acquire(&endpoint(1)).is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_queue_is_capped() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(None, Some(2), None);
        for _ in 0..3 {
            lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        }
        assert_eq!(lru.idle_count(&endpoint(1)), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lru_evicts_oldest_endpoint_and_closes_its_idle() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(Some(2), None, None);
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(2), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(3), Conn::new(FakeConn::new(&closed)));

        assert_eq!(lru.endpoint_count(), 2);
        assert_eq!(lru.keys_mru_first(), vec![endpoint(3), endpoint(2)]);
        // both idle connections of endpoint 1 were closed at eviction
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(lru.acquire(&endpoint(1)).is_none());
    }

    #[test]
    fn release_refreshes_recency() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(Some(2), None, None);
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(2), Conn::new(FakeConn::new(&closed)));
        // touch endpoint 1: it moves from tail back to head
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.keys_mru_first(), vec![endpoint(1), endpoint(2)]);

        lru.release(endpoint(3), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.keys_mru_first(), vec![endpoint(3), endpoint(1)]);
    }

    #[test]
    fn releasing_the_head_is_a_noop_move() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(Some(2), None, None);
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.keys_mru_first(), vec![endpoint(1)]);
        assert_eq!(lru.idle_count(&endpoint(1)), 2);
    }

    #[test]
    fn evicts_down_to_empty_for_tiny_capacity() {
        let closed = Arc::new(AtomicUsize::new(0));
        let lru = EndpointLru::new(Some(1), None, None);
        lru.release(endpoint(1), Conn::new(FakeConn::new(&closed)));
        lru.release(endpoint(2), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.endpoint_count(), 1);
        assert_eq!(lru.keys_mru_first(), vec![endpoint(2)]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // the arena slot of the evicted node is reused
        lru.release(endpoint(3), Conn::new(FakeConn::new(&closed)));
        assert_eq!(lru.keys_mru_first(), vec![endpoint(3)]);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }
}
