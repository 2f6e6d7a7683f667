use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Cache of peers that have actually delivered metadata before. Good peers
// tend to carry many torrents, so the scheduler samples from here to widen
// each new infohash's chances.

#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    ip: Ipv4Addr,
    port: u16,
    ts: u64,
}

pub struct PeerPool {
    path: PathBuf,
    ttl: Duration,
    capacity: usize,
    // addr -> unix seconds of the last successful fetch
    entries: HashMap<SocketAddrV4, u64>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PeerPool {
    /// Load the pool from its line-delimited state file. A missing or partly
    /// garbled file is not an error; whatever parses within TTL is kept.
    pub fn load(path: impl Into<PathBuf>, ttl: Duration, capacity: usize) -> Self {
        let path = path.into();
        let mut pool = Self {
            path,
            ttl,
            capacity,
            entries: HashMap::new(),
        };

        let raw = match std::fs::read_to_string(&pool.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%err, path = %pool.path.display(), "peer pool: load failed");
                }
                return pool;
            }
        };

        let now = now_unix();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<PeerRecord>(line) else {
                continue;
            };
            if record.port == 0 || now.saturating_sub(record.ts) > ttl.as_secs() {
                continue;
            }
            let addr = SocketAddrV4::new(record.ip, record.port);
            let slot = pool.entries.entry(addr).or_insert(0);
            if record.ts > *slot {
                *slot = record.ts;
            }
        }
        pool.enforce_capacity();
        tracing::info!(peers = pool.entries.len(), "peer pool: loaded");
        pool
    }

    pub fn mark_ok(&mut self, addr: SocketAddrV4) {
        self.entries.insert(addr, now_unix());
        self.enforce_capacity();
    }

    /// Up to `k` distinct non-expired peers, uniformly at random.
    pub fn sample(&self, k: usize) -> Vec<SocketAddrV4> {
        use rand::seq::IteratorRandom;
        if k == 0 {
            return Vec::new();
        }
        let now = now_unix();
        let ttl = self.ttl.as_secs();
        let mut rng = rand::thread_rng();
        self.entries
            .iter()
            .filter(|(_, ts)| now.saturating_sub(**ts) <= ttl)
            .map(|(addr, _)| *addr)
            .choose_multiple(&mut rng, k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Rewrite the state file with the current live entries.
    pub fn persist(&self) {
        if let Err(err) = self.write_file(&self.path) {
            tracing::warn!(%err, path = %self.path.display(), "peer pool: persist failed");
        }
    }

    fn write_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut out = Vec::with_capacity(self.entries.len() * 48);
        let now = now_unix();
        let ttl = self.ttl.as_secs();
        for (addr, ts) in &self.entries {
            if now.saturating_sub(*ts) > ttl {
                continue;
            }
            let record = PeerRecord {
                ip: *addr.ip(),
                port: addr.port(),
                ts: *ts,
            };
            serde_json::to_writer(&mut out, &record).expect("peer record serializes");
            out.push(b'\n');
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(&out)
    }

    fn enforce_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(addr, _)| *addr);
            match oldest {
                Some(addr) => {
                    self.entries.remove(&addr);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    pub fn empty_for_tests() -> Self {
        Self {
            path: PathBuf::from("/nonexistent/metadata_peers.jsonl"),
            ttl: Duration::from_secs(24 * 3600),
            capacity: 4096,
            entries: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, n), 51413)
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let mut pool = PeerPool::empty_for_tests();
        pool.capacity = 3;
        pool.entries.insert(addr(1), 100);
        pool.entries.insert(addr(2), 200);
        pool.entries.insert(addr(3), 300);
        pool.mark_ok(addr(4));
        assert_eq!(pool.len(), 3);
        assert!(!pool.entries.contains_key(&addr(1)));
        assert!(pool.entries.contains_key(&addr(4)));
    }

    #[test]
    fn expired_entries_are_invisible_to_sample() {
        let mut pool = PeerPool::empty_for_tests();
        pool.ttl = Duration::from_secs(60);
        pool.entries.insert(addr(1), now_unix());
        pool.entries.insert(addr(2), now_unix() - 3600);
        let sampled = pool.sample(10);
        assert_eq!(sampled, vec![addr(1)]);
    }

    #[test]
    fn sample_does_not_repeat_peers() {
        let mut pool = PeerPool::empty_for_tests();
        for n in 0..10 {
            pool.mark_ok(addr(n));
        }
        let mut sampled = pool.sample(10);
        sampled.sort();
        sampled.dedup();
        assert_eq!(sampled.len(), 10);
    }

    #[test]
    fn persist_then_load_round_trips_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata_peers.jsonl");

        let mut pool = PeerPool::load(&path, Duration::from_secs(3600), 100);
        pool.mark_ok(addr(1));
        pool.mark_ok(addr(2));
        pool.entries.insert(addr(3), 1); // long expired
        pool.persist();

        let reloaded = PeerPool::load(&path, Duration::from_secs(3600), 100);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.entries.contains_key(&addr(1)));
        assert!(reloaded.entries.contains_key(&addr(2)));
    }

    #[test]
    fn load_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata_peers.jsonl");
        let ts = now_unix();
        std::fs::write(
            &path,
            format!("not json\n{{\"ip\":\"1.2.3.4\",\"port\":6881,\"ts\":{ts}}}\n{{\"ip\":\"bad\"}}\n"),
        )
        .unwrap();

        let pool = PeerPool::load(&path, Duration::from_secs(3600), 100);
        assert_eq!(pool.len(), 1);
    }
}
