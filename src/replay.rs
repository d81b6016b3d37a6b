//! Server-side replay defence: a per-(user, client) sliding window over
//! `connection_id` values, shared across every session a listener owns.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

/// A queue is considered active — its window still binding — only while
/// it has outstanding references and has been touched recently.
const ACTIVE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Width of a fresh queue's initial window, and the jump beyond which an
/// id is rejected as an absurd leap rather than a replay or a legitimate
/// successor.
const WINDOW: i64 = 64;
const MAX_JUMP: i64 = 0x4000;

/// `front` is pulled forward once it falls this far behind `back`, even
/// past ids that were never allocated.
const MAX_GAP: i64 = 0x1000;

/// Per-uid LRU capacities beyond this are refused outright rather than
/// silently uncapped; `protocol_param` can only raise `max_client` up to
/// this ceiling.
const HARD_MAX_CLIENTS: usize = 1024;

/// One (user, client) pair's acceptance window.
struct ClientQueue {
    front: i64,
    back: i64,
    alloc: HashSet<i64>,
    enable: bool,
    ref_count: u32,
    last_update: Instant,
}

impl ClientQueue {
    fn fresh(conn_id: i64, now: Instant) -> Self {
        Self {
            front: conn_id - WINDOW,
            back: conn_id + 1,
            alloc: HashSet::new(),
            enable: true,
            ref_count: 0,
            last_update: now,
        }
    }

    fn is_active(&self, now: Instant) -> bool {
        self.ref_count > 0 && now.duration_since(self.last_update) < ACTIVE_WINDOW
    }

    fn re_enable(&mut self, conn_id: i64, now: Instant) {
        self.front = conn_id - WINDOW;
        self.back = conn_id + 1;
        self.alloc.clear();
        self.enable = true;
        self.ref_count = 0;
        self.last_update = now;
    }

    /// Accept or refuse `conn_id`. Only ever called while holding the
    /// per-uid lock, so this is free to mutate without further guarding.
    fn insert(&mut self, conn_id: i64, now: Instant) -> bool {
        if !self.enable {
            return false;
        }
        if !self.is_active(now) {
            self.re_enable(conn_id, now);
        }
        if conn_id < self.front || conn_id > self.front + MAX_JUMP || self.alloc.contains(&conn_id) {
            return false;
        }

        self.back = self.back.max(conn_id + 1);
        self.alloc.insert(conn_id);

        // `front` only ever advances past ids contiguously removed from
        // `alloc`, or once it falls more than `MAX_GAP` behind `back` —
        // never by forcing it to a fixed distance from the highest id seen.
        while self.alloc.contains(&self.front) || self.front + MAX_GAP < self.back {
            self.alloc.remove(&self.front);
            self.front += 1;
        }

        self.ref_count += 1;
        self.last_update = now;
        true
    }

    fn release(&mut self) {
        self.ref_count = self.ref_count.saturating_sub(1);
    }
}

type ClientTable = LruCache<[u8; 4], ClientQueue>;

/// Server-wide replay guard, handed to every [`crate::session::Session`]
/// via `Arc<ReplayGuard>`. Sharded per user id via `DashMap`, and guarded
/// per user by a `parking_lot::Mutex` around that user's bounded LRU of
/// clients — one mutex per uid keeps contention scoped to clients
/// sharing the same identity.
pub struct ReplayGuard {
    user_table: DashMap<[u8; 4], Mutex<ClientTable>>,
    max_clients: usize,
}

impl ReplayGuard {
    pub fn new(max_clients: usize) -> Self {
        Self {
            user_table: DashMap::new(),
            max_clients: max_clients.clamp(1, HARD_MAX_CLIENTS),
        }
    }

    fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_clients).expect("max_clients clamped to >= 1")
    }

    /// Accept or refuse a `(uid, client_id, connection_id)` triple. Ids
    /// below the window, far beyond it, or already seen are refused;
    /// acceptance establishes or extends that client's window.
    pub fn insert(&self, uid: [u8; 4], client_id: [u8; 4], conn_id: i64) -> bool {
        let now = Instant::now();
        let shard = self
            .user_table
            .entry(uid)
            .or_insert_with(|| Mutex::new(LruCache::new(self.capacity())));
        let mut table = shard.lock();

        let needs_fresh_slot = match table.peek(&client_id) {
            None => true,
            Some(q) => !q.enable,
        };

        if needs_fresh_slot {
            if table.len() >= table.cap().get() {
                if let Some((_, front_queue)) = table.peek_lru() {
                    if front_queue.is_active(now) {
                        tracing::warn!(uid = ?uid, client = ?client_id, "replay guard at capacity, refusing new client");
                        return false;
                    }
                }
            }
            table.put(client_id, ClientQueue::fresh(conn_id, now));
        }

        let queue = table
            .get_mut(&client_id)
            .expect("just inserted or already present above");
        let accepted = queue.insert(conn_id, now);
        if !accepted {
            tracing::debug!(uid = ?uid, client = ?client_id, conn_id, "replay guard refused connection id");
        }
        accepted
    }

    /// Release a session's hold on its queue. Once `ref_count` reaches
    /// zero and the queue goes idle, it becomes eligible for LRU eviction.
    pub fn release(&self, uid: [u8; 4], client_id: [u8; 4]) {
        if let Some(shard) = self.user_table.get(&uid) {
            let mut table = shard.lock();
            if let Some(queue) = table.peek_mut(&client_id) {
                queue.release();
            }
        }
    }
}
