use crate::dht::KNode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

// Persisted DHT contacts so a restart does not start cold from the public
// routers every time.

const DEFAULT_BOOTSTRAP: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    nid_hex: String,
    ip: Ipv4Addr,
    port: u16,
}

pub struct BootstrapStore {
    path: PathBuf,
    capacity: usize,
    // nid -> addr; newest sighting wins
    nodes: HashMap<[u8; 20], SocketAddrV4>,
    dirty: bool,
}

impl BootstrapStore {
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let mut store = Self {
            path,
            capacity,
            nodes: HashMap::new(),
            dirty: false,
        };

        let raw = match std::fs::read_to_string(&store.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%err, path = %store.path.display(), "bootstrap store: load failed");
                }
                return store;
            }
        };

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<NodeRecord>(line) else {
                continue;
            };
            let Some(nid) = parse_nid(&record.nid_hex) else {
                continue;
            };
            if record.port == 0 {
                continue;
            }
            if store.nodes.len() >= store.capacity {
                break;
            }
            store.nodes.insert(nid, SocketAddrV4::new(record.ip, record.port));
        }
        tracing::info!(contacts = store.nodes.len(), "bootstrap store: loaded");
        store
    }

    /// Merge candidates observed while the routing deque was healthy.
    pub fn record(&mut self, nodes: &[KNode]) {
        for node in nodes {
            if node.addr.port() == 0 {
                continue;
            }
            if self.nodes.len() >= self.capacity && !self.nodes.contains_key(&node.nid) {
                continue;
            }
            if self.nodes.insert(node.nid, node.addr) != Some(node.addr) {
                self.dirty = true;
            }
        }
    }

    pub fn contacts(&self) -> Vec<KNode> {
        self.nodes
            .iter()
            .map(|(nid, addr)| KNode {
                nid: *nid,
                addr: *addr,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn fallback_hosts(&self) -> &'static [&'static str] {
        DEFAULT_BOOTSTRAP
    }

    /// Rewrite the state file if anything changed since the last write.
    pub fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        match self.write_file(&self.path) {
            Ok(()) => self.dirty = false,
            Err(err) => {
                tracing::warn!(%err, path = %self.path.display(), "bootstrap store: persist failed");
            }
        }
    }

    fn write_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut out = Vec::with_capacity(self.nodes.len() * 64);
        for (nid, addr) in &self.nodes {
            let record = NodeRecord {
                nid_hex: hex::encode(nid),
                ip: *addr.ip(),
                port: addr.port(),
            };
            serde_json::to_writer(&mut out, &record).expect("node record serializes");
            out.push(b'\n');
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(&out)
    }
}

fn parse_nid(hex_str: &str) -> Option<[u8; 20]> {
    let raw = hex::decode(hex_str).ok()?;
    let mut nid = [0u8; 20];
    if raw.len() != 20 {
        return None;
    }
    nid.copy_from_slice(&raw);
    Some(nid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> KNode {
        KNode {
            nid: [n; 20],
            addr: SocketAddrV4::new(Ipv4Addr::new(5, 5, 5, n), 6881),
        }
    }

    #[test]
    fn record_dedups_on_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BootstrapStore::load(dir.path().join("bootstrap_nodes.jsonl"), 200);

        store.record(&[node(1), node(2)]);
        let moved = KNode {
            nid: [1; 20],
            addr: SocketAddrV4::new(Ipv4Addr::new(5, 5, 5, 99), 1234),
        };
        store.record(&[moved]);

        assert_eq!(store.len(), 2);
        let contacts = store.contacts();
        let relocated = contacts.iter().find(|n| n.nid == [1; 20]).unwrap();
        assert_eq!(relocated.addr, moved.addr);
    }

    #[test]
    fn capacity_is_a_hard_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BootstrapStore::load(dir.path().join("bootstrap_nodes.jsonl"), 3);
        store.record(&[node(1), node(2), node(3), node(4), node(5)]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap_nodes.jsonl");

        let mut store = BootstrapStore::load(&path, 200);
        store.record(&[node(1), node(2), node(3)]);
        store.persist();

        let reloaded = BootstrapStore::load(&path, 200);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contacts().iter().any(|n| n.nid == [2; 20]));
    }

    #[test]
    fn fallback_hosts_are_the_public_routers() {
        let dir = tempfile::tempdir().unwrap();
        let store = BootstrapStore::load(dir.path().join("x.jsonl"), 10);
        assert!(store
            .fallback_hosts()
            .contains(&"router.bittorrent.com:6881"));
    }
}
