use crate::config::Config;
use crate::metadata;
use crate::peer_pool::PeerPool;
use crate::storage::Storage;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval, timeout};

// Dispatcher between the DHT engine and the metadata workers. Owns the
// bounded job queue and the gates in front of it: recently-seen pairs,
// per-infohash failure counts, blacklisted peers.

pub type InfoHash = [u8; 20];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Job {
    pub infohash: InfoHash,
    pub peer: SocketAddrV4,
}

struct FailEntry {
    count: u32,
    banned_until: Option<Instant>,
}

struct Gates {
    seen: RollingBloom,
    fail: HashMap<InfoHash, FailEntry>,
    bad: HashMap<SocketAddrV4, Instant>,
    ok_total: u64,
    fail_total: u64,
    dropped_full: u64,
}

struct Inner {
    cfg: Arc<Config>,
    gates: Mutex<Gates>,
    pool: Arc<Mutex<PeerPool>>,
    tx: mpsc::Sender<Job>,
    closed: AtomicBool,
}

/// Cheap cloneable handle the DHT engine enqueues through.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

impl SchedulerHandle {
    /// Offer an observed (infohash, peer) pair. Every rejection is silent:
    /// the UDP loop must never care. On acceptance, a few pooled peers are
    /// offered for the same infohash to raise the odds on popular torrents.
    pub fn offer(&self, infohash: InfoHash, peer: SocketAddrV4) -> bool {
        if !self.inner.admit(infohash, peer) {
            return false;
        }

        let hints = {
            let pool = self.inner.pool.lock().expect("peer pool lock");
            pool.sample(self.inner.cfg.sched_pool_hints)
        };
        for hinted in hints {
            if hinted != peer {
                self.inner.admit(infohash, hinted);
            }
        }
        true
    }

    #[cfg(test)]
    fn seen(&self, infohash: InfoHash, peer: SocketAddrV4) -> bool {
        let mut gates = self.inner.gates.lock().unwrap();
        gates.seen.contains(&seen_key(&infohash, peer))
    }
}

impl Inner {
    fn admit(&self, infohash: InfoHash, peer: SocketAddrV4) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }

        let now = Instant::now();
        let mut gates = self.gates.lock().expect("gates lock");

        match gates.bad.get(&peer) {
            Some(until) if *until > now => return false,
            Some(_) => {
                gates.bad.remove(&peer);
            }
            None => {}
        }

        if let Some(entry) = gates.fail.get(&infohash) {
            match entry.banned_until {
                Some(until) if until > now => return false,
                // Cooldown served; the infohash starts over.
                Some(_) => {
                    gates.fail.remove(&infohash);
                }
                None => {}
            }
        }

        let key = seen_key(&infohash, peer);
        if gates.seen.contains(&key) {
            return false;
        }

        // Reserve the queue slot before recording the pair as seen, so a
        // saturated queue leaves no trace and the pair can be re-offered.
        match self.tx.try_send(Job { infohash, peer }) {
            Ok(()) => {
                gates.seen.insert(&key);
                true
            }
            Err(_) => {
                gates.dropped_full += 1;
                false
            }
        }
    }

    fn note_success(&self, job: Job) {
        {
            let mut gates = self.gates.lock().expect("gates lock");
            gates.fail.remove(&job.infohash);
            gates.ok_total += 1;
        }
        let mut pool = self.pool.lock().expect("peer pool lock");
        pool.mark_ok(job.peer);
    }

    fn note_failure(&self, job: Job) {
        let now = Instant::now();
        let mut gates = self.gates.lock().expect("gates lock");
        gates.fail_total += 1;

        let threshold = self.cfg.sched_fail_threshold;
        let cooldown = Duration::from_secs(self.cfg.sched_fail_cooldown_secs);
        let entry = gates.fail.entry(job.infohash).or_insert(FailEntry {
            count: 0,
            banned_until: None,
        });
        entry.count += 1;
        if entry.count >= threshold && entry.banned_until.is_none() {
            entry.banned_until = Some(now + cooldown);
        }

        let bad_until = now + Duration::from_secs(self.cfg.sched_bad_peer_secs);
        gates.bad.insert(job.peer, bad_until);
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    rx: mpsc::Receiver<Job>,
    sem: Arc<Semaphore>,
    storage: Arc<Storage>,
}

pub fn new(
    cfg: Arc<Config>,
    pool: Arc<Mutex<PeerPool>>,
    storage: Arc<Storage>,
) -> (Scheduler, SchedulerHandle) {
    let (tx, rx) = mpsc::channel(cfg.sched_queue_capacity);
    let seen = RollingBloom::new(
        cfg.sched_seen_bits_pow2,
        cfg.sched_seen_hashes,
        Duration::from_secs(cfg.sched_seen_window_secs),
    );
    let inner = Arc::new(Inner {
        gates: Mutex::new(Gates {
            seen,
            fail: HashMap::new(),
            bad: HashMap::new(),
            ok_total: 0,
            fail_total: 0,
            dropped_full: 0,
        }),
        pool,
        tx,
        closed: AtomicBool::new(false),
        cfg: cfg.clone(),
    });
    let sem = Arc::new(Semaphore::new(cfg.worker_concurrency));
    (
        Scheduler {
            inner: inner.clone(),
            rx,
            sem,
            storage,
        },
        SchedulerHandle { inner },
    )
}

impl Scheduler {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        enum Event {
            Shutdown,
            Heartbeat,
            Job(Option<Job>),
        }

        let mut hb = interval(Duration::from_secs(5));
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => Event::Shutdown,
                _ = hb.tick() => Event::Heartbeat,
                job = self.rx.recv() => Event::Job(job),
            };
            match event {
                Event::Shutdown | Event::Job(None) => break,
                Event::Heartbeat => self.heartbeat(),
                Event::Job(Some(job)) => self.dispatch(job).await,
            }
        }

        // Stop intake, then give in-flight workers a moment to land.
        self.inner.closed.store(true, Ordering::Relaxed);
        self.rx.close();
        let workers = self.inner.cfg.worker_concurrency as u32;
        let grace = Duration::from_secs(self.inner.cfg.sched_shutdown_grace_secs);
        match timeout(grace, self.sem.acquire_many(workers)).await {
            Ok(_) => tracing::info!("scheduler: all workers finished"),
            Err(_) => tracing::warn!("scheduler: grace period expired with workers in flight"),
        }
    }

    async fn dispatch(&self, job: Job) {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore closed");

        let inner = self.inner.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let hash = hex::encode(job.infohash);
            match metadata::fetch(&inner.cfg, job.peer, job.infohash).await {
                Ok(info) => {
                    tracing::debug!(%hash, peer = %job.peer, bytes = info.len(), "worker: verified metadata");
                    inner.note_success(job);
                    if let Err(err) = storage.store(job.infohash, &info, job.peer) {
                        tracing::warn!(%err, %hash, "storage failed");
                    }
                }
                Err(err) => {
                    tracing::debug!(%hash, peer = %job.peer, %err, "worker: fetch failed");
                    inner.note_failure(job);
                }
            }
        });
    }

    fn heartbeat(&self) {
        let now = Instant::now();
        let (ok, fail, dropped, bad, banned) = {
            let mut gates = self.inner.gates.lock().expect("gates lock");
            gates.bad.retain(|_, until| *until > now);
            let banned = gates
                .fail
                .values()
                .filter(|e| e.banned_until.is_some_and(|t| t > now))
                .count();
            (
                gates.ok_total,
                gates.fail_total,
                gates.dropped_full,
                gates.bad.len(),
                banned,
            )
        };
        let queued = self.inner.cfg.sched_queue_capacity - self.inner.tx.capacity();
        let inflight = self.inner.cfg.worker_concurrency - self.sem.available_permits();
        tracing::info!(queued, inflight, ok, fail, dropped, bad, banned, "scheduler: status");
    }

    #[cfg(test)]
    fn try_pop(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}

fn seen_key(infohash: &InfoHash, peer: SocketAddrV4) -> [u8; 26] {
    let mut key = [0u8; 26];
    key[..20].copy_from_slice(infohash);
    key[20..24].copy_from_slice(&peer.ip().octets());
    key[24..].copy_from_slice(&peer.port().to_be_bytes());
    key
}

/// Two-window Bloom filter: memory-bounded dedup where entries age out by
/// dropping the whole previous window instead of per-entry bookkeeping.
struct RollingBloom {
    current: Vec<u64>,
    previous: Vec<u64>,
    mask: u64,
    k: u8,
    window: Duration,
    rotated_at: Instant,
}

impl RollingBloom {
    fn new(bits_pow2: u32, k: u8, window: Duration) -> Self {
        let bits = 1usize << bits_pow2;
        let words = bits / 64;
        Self {
            current: vec![0; words],
            previous: vec![0; words],
            mask: bits as u64 - 1,
            k: k.max(1),
            window,
            rotated_at: Instant::now(),
        }
    }

    fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() < self.window {
            return;
        }
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.fill(0);
        self.rotated_at = Instant::now();
    }

    fn contains(&mut self, item: &[u8]) -> bool {
        self.maybe_rotate();
        let (h1, h2) = bloom_hashes(item);
        'window: for bits in [&self.current, &self.previous] {
            for i in 0..self.k {
                let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) & self.mask;
                if bits[(bit >> 6) as usize] & (1 << (bit & 63)) == 0 {
                    continue 'window;
                }
            }
            return true;
        }
        false
    }

    fn insert(&mut self, item: &[u8]) {
        let (h1, h2) = bloom_hashes(item);
        for i in 0..self.k {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) & self.mask;
            self.current[(bit >> 6) as usize] |= 1 << (bit & 63);
        }
    }
}

fn bloom_hashes(item: &[u8]) -> (u64, u64) {
    // Double hashing; forcing h2 odd spreads the probes over the bitspace.
    let h1 = xxhash_rust::xxh3::xxh3_64(item);
    let h2 = xxhash_rust::xxh3::xxh3_64_with_seed(item, 0x9E37_79B9_7F4A_7C15) | 1;
    (h1, h2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_setup(cfg: Config) -> (Scheduler, SchedulerHandle) {
        let cfg = Arc::new(cfg);
        let pool = Arc::new(Mutex::new(PeerPool::empty_for_tests()));
        let storage = Arc::new(Storage::disabled_for_tests());
        new(cfg, pool, storage)
    }

    fn peer(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, n), 6881)
    }

    fn hash(n: u8) -> InfoHash {
        [n; 20]
    }

    #[test]
    fn same_pair_is_accepted_once_per_window() {
        let (_sched, handle) = test_setup(Config::default_for_tests());
        assert!(handle.offer(hash(1), peer(1)));
        assert!(!handle.offer(hash(1), peer(1)));
        // Different peer for the same infohash still goes through.
        assert!(handle.offer(hash(1), peer(2)));
    }

    #[test]
    fn full_queue_drops_silently_and_leaves_no_seen_trace() {
        let mut cfg = Config::default_for_tests();
        cfg.sched_queue_capacity = 4;
        let (mut sched, handle) = test_setup(cfg);

        for n in 1..=4 {
            assert!(handle.offer(hash(n), peer(n)));
        }
        assert!(!handle.offer(hash(5), peer(5)));
        assert!(!handle.seen(hash(5), peer(5)));

        // The moment a slot frees up, the same observation is usable again.
        assert_eq!(sched.try_pop().map(|j| j.infohash), Some(hash(1)));
        assert!(handle.offer(hash(5), peer(5)));
    }

    #[test]
    fn failing_infohash_gets_blacklisted_after_threshold() {
        let mut cfg = Config::default_for_tests();
        cfg.sched_fail_threshold = 2;
        let (_sched, handle) = test_setup(cfg);

        handle.inner.note_failure(Job { infohash: hash(9), peer: peer(1) });
        assert!(handle.offer(hash(9), peer(2)));

        handle.inner.note_failure(Job { infohash: hash(9), peer: peer(2) });
        assert!(!handle.offer(hash(9), peer(3)));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut cfg = Config::default_for_tests();
        cfg.sched_fail_threshold = 2;
        let (_sched, handle) = test_setup(cfg);

        handle.inner.note_failure(Job { infohash: hash(4), peer: peer(1) });
        handle.inner.note_success(Job { infohash: hash(4), peer: peer(2) });
        handle.inner.note_failure(Job { infohash: hash(4), peer: peer(3) });
        assert!(handle.offer(hash(4), peer(4)));
    }

    #[test]
    fn bad_peer_is_rejected_until_deadline() {
        let (_sched, handle) = test_setup(Config::default_for_tests());

        handle.inner.note_failure(Job { infohash: hash(1), peer: peer(7) });
        assert!(!handle.offer(hash(2), peer(7)));
        assert!(handle.offer(hash(2), peer(8)));
    }

    #[test]
    fn accepted_observation_pulls_pool_hints() {
        let cfg = Arc::new(Config::default_for_tests());
        let mut pool = PeerPool::empty_for_tests();
        pool.mark_ok(peer(31));
        pool.mark_ok(peer(32));
        let pool = Arc::new(Mutex::new(pool));
        let storage = Arc::new(Storage::disabled_for_tests());
        let (mut sched, handle) = new(cfg, pool, storage);

        assert!(handle.offer(hash(1), peer(1)));
        let mut jobs = Vec::new();
        while let Some(job) = sched.try_pop() {
            jobs.push(job);
        }
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.infohash == hash(1)));
        assert!(jobs.iter().any(|j| j.peer == peer(31)));
        assert!(jobs.iter().any(|j| j.peer == peer(32)));
    }

    #[test]
    fn rolling_bloom_forgets_after_two_rotations() {
        let mut bloom = RollingBloom::new(10, 4, Duration::from_millis(0));
        bloom.insert(b"entry");
        // window = 0 means every touch rotates: one rotation keeps the entry
        // visible in the previous window, the second drops it.
        assert!(bloom.contains(b"entry"));
        assert!(!bloom.contains(b"entry"));
    }
}
