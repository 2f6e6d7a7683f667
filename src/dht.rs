use crate::bencode::{self, Value};
use crate::bootstrap::BootstrapStore;
use crate::config::Config;
use crate::scheduler::{InfoHash, SchedulerHandle};
use rand::RngCore;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

// BEP-5 crawler engine. One cooperative task over one UDP socket:
// - answers ping / find_node / get_peers / announce_peer so remote routing
//   tables keep us around
// - harvests info_hash from get_peers / announce_peer into the scheduler
// - churns a deque of known nodes with paced find_node probes; responses
//   refill the deque

const COMPACT_NODE_LEN: usize = 26;
const MAX_DATAGRAM: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KNode {
    pub nid: [u8; 20],
    pub addr: SocketAddrV4,
}

pub struct DhtEngine {
    cfg: Arc<Config>,
    socket: UdpSocket,
    nid: [u8; 20],
    nodes: VecDeque<KNode>,
    token_secret: u64,
    jobs: SchedulerHandle,
    bootstrap: BootstrapStore,

    rx: u64,
    tx: u64,
    q_get_peers: u64,
    q_announce: u64,
    harvested: u64,
}

impl DhtEngine {
    pub fn new(
        cfg: Arc<Config>,
        socket: UdpSocket,
        jobs: SchedulerHandle,
        bootstrap: BootstrapStore,
    ) -> Self {
        Self {
            cfg,
            socket,
            nid: random_node_id(),
            nodes: VecDeque::new(),
            token_secret: rand::thread_rng().next_u64(),
            jobs,
            bootstrap,
            rx: 0,
            tx: 0,
            q_get_peers: 0,
            q_announce: 0,
            harvested: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.join().await;

        // One deque entry per tick caps outbound probes at the configured
        // rate without a separate accounting structure.
        let drain_period = Duration::from_secs_f64(1.0 / self.cfg.dht_outbound_rate.max(1) as f64);
        let mut drain_int = interval(drain_period);
        drain_int.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_int = interval(Duration::from_secs(self.cfg.dht_rejoin_interval_secs));
        let mut persist_int = interval(Duration::from_secs(self.cfg.dht_persist_interval_secs));

        enum Event {
            Shutdown,
            Probe,
            Status,
            Persist,
            Datagram(io::Result<(usize, SocketAddr)>),
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => Event::Shutdown,
                _ = drain_int.tick() => Event::Probe,
                _ = status_int.tick() => Event::Status,
                _ = persist_int.tick() => Event::Persist,
                recv = self.socket.recv_from(&mut buf) => Event::Datagram(recv),
            };
            match event {
                Event::Shutdown => break,
                Event::Probe => self.probe_one().await,
                Event::Status => self.status_tick().await,
                Event::Persist => self.persist_if_healthy(),
                Event::Datagram(Err(err)) => {
                    tracing::warn!(%err, "dht: recv failed");
                }
                Event::Datagram(Ok((n, from))) => {
                    let SocketAddr::V4(from) = from else {
                        continue;
                    };
                    self.rx += 1;
                    self.on_datagram(&buf[..n], from).await;
                }
            }
        }

        self.bootstrap.persist();
        tracing::info!(rx = self.rx, tx = self.tx, harvested = self.harvested, "dht: stopped");
    }

    async fn on_datagram(&mut self, raw: &[u8], from: SocketAddrV4) {
        let Ok(msg) = bencode::decode(raw) else {
            return;
        };
        match msg.get_bytes(b"y") {
            Some(b"r") => self.on_response(&msg, from),
            Some(b"q") => self.on_query(&msg, from).await,
            // KRPC errors carry nothing a crawler wants.
            _ => {}
        }
    }

    fn on_response(&mut self, msg: &Value, from: SocketAddrV4) {
        let Some(r) = msg.get(b"r") else {
            return;
        };
        let Some(raw_nodes) = r.get_bytes(b"nodes") else {
            return;
        };
        let Some(found) = parse_compact_nodes(raw_nodes) else {
            return;
        };
        if found.is_empty() {
            return;
        }

        // The responder proved itself useful; remember it for the next run.
        if let Some(rid) = r.get_bytes(b"id").and_then(as_id20) {
            self.bootstrap.record(&[KNode { nid: rid, addr: from }]);
        }
        self.bootstrap.record(&found);

        for node in found {
            self.push_node(node);
        }
    }

    async fn on_query(&mut self, msg: &Value, from: SocketAddrV4) {
        let Some(tid) = msg.get_bytes(b"t").map(|t| t.to_vec()) else {
            return;
        };
        match msg.get_bytes(b"q") {
            Some(b"ping") => self.reply_ack(&tid, from).await,
            Some(b"find_node") => self.on_find_node(msg, &tid, from).await,
            Some(b"get_peers") => {
                self.q_get_peers += 1;
                self.on_get_peers(msg, &tid, from).await;
            }
            Some(b"announce_peer") => {
                self.q_announce += 1;
                self.on_announce_peer(msg, &tid, from).await;
            }
            _ => self.play_dead(&tid, from).await,
        }
    }

    async fn reply_ack(&mut self, tid: &[u8], from: SocketAddrV4) {
        let reply = reply_dict(tid, vec![(b"id".to_vec(), Value::bytes(&self.nid[..]))]);
        self.send(&reply, from).await;
    }

    async fn on_find_node(&mut self, msg: &Value, tid: &[u8], from: SocketAddrV4) {
        // Appear maximally close to whoever asks so they keep talking to us.
        let spoof = msg
            .get(b"a")
            .and_then(|a| a.get_bytes(b"id"))
            .and_then(as_id20)
            .map(|id| neighbor_id(&id))
            .unwrap_or(self.nid);

        let mut compact = Vec::with_capacity(8 * COMPACT_NODE_LEN);
        for node in self.sample_nodes(8) {
            compact.extend_from_slice(&node.nid);
            compact.extend_from_slice(&node.addr.ip().octets());
            compact.extend_from_slice(&node.addr.port().to_be_bytes());
        }

        let reply = reply_dict(
            tid,
            vec![
                (b"id".to_vec(), Value::bytes(&spoof[..])),
                (b"nodes".to_vec(), Value::Bytes(compact)),
            ],
        );
        self.send(&reply, from).await;
    }

    async fn on_get_peers(&mut self, msg: &Value, tid: &[u8], from: SocketAddrV4) {
        let Some(infohash) = msg
            .get(b"a")
            .and_then(|a| a.get_bytes(b"info_hash"))
            .and_then(as_id20)
        else {
            return;
        };

        self.harvest(infohash, from);

        // Only find_node traffic spoofs a neighbor ID; here the plain self
        // ID goes out, same as ping and announce_peer acks.
        let reply = reply_dict(
            tid,
            vec![
                (b"id".to_vec(), Value::bytes(&self.nid[..])),
                (b"nodes".to_vec(), Value::Bytes(Vec::new())),
                (b"token".to_vec(), Value::bytes(&self.token_for(from)[..])),
            ],
        );
        self.send(&reply, from).await;
    }

    async fn on_announce_peer(&mut self, msg: &Value, tid: &[u8], from: SocketAddrV4) {
        if let Some(a) = msg.get(b"a") {
            if let Some(infohash) = a.get_bytes(b"info_hash").and_then(as_id20) {
                let token_ok = a.get_bytes(b"token") == Some(&self.token_for(from)[..]);
                if token_ok {
                    let implied = a.get_int(b"implied_port").unwrap_or(0) != 0;
                    let port = if implied {
                        Some(from.port())
                    } else {
                        a.get_int(b"port")
                            .and_then(|p| u16::try_from(p).ok())
                            .filter(|p| *p != 0)
                    };
                    if let Some(port) = port {
                        self.harvest(infohash, SocketAddrV4::new(*from.ip(), port));
                        // NATed announcers are often reachable on the UDP
                        // source port even when they announce another one.
                        if port != from.port() {
                            self.harvest(infohash, from);
                        }
                    }
                }
            }
        }
        self.reply_ack(tid, from).await;
    }

    /// Unknown query: a vague server error keeps us off blocklists without
    /// advertising anything.
    async fn play_dead(&mut self, tid: &[u8], from: SocketAddrV4) {
        let reply = Value::Dict(vec![
            (
                b"e".to_vec(),
                Value::List(vec![Value::Int(202), Value::bytes(&b"Server Error"[..])]),
            ),
            (b"t".to_vec(), Value::bytes(tid)),
            (b"y".to_vec(), Value::bytes(&b"e"[..])),
        ]);
        self.send(&reply, from).await;
    }

    fn harvest(&mut self, infohash: InfoHash, peer: SocketAddrV4) {
        // Queue saturation and dedup are the scheduler's call; a refusal
        // must never stall the UDP loop.
        if self.jobs.offer(infohash, peer) {
            self.harvested += 1;
        }
    }

    async fn probe_one(&mut self) {
        let Some(node) = self.nodes.pop_front() else {
            return;
        };
        self.send_find_node(SocketAddr::V4(node.addr), Some(node.nid)).await;
    }

    async fn status_tick(&mut self) {
        tracing::info!(
            rx = self.rx,
            tx = self.tx,
            nodes = self.nodes.len(),
            get_peers = self.q_get_peers,
            announce = self.q_announce,
            harvested = self.harvested,
            "dht: status"
        );
        if self.nodes.len() <= self.cfg.dht_rejoin_low_water {
            self.join().await;
        }
    }

    async fn join(&mut self) {
        // Fresh identity per (re)join; replies spoof neighbors anyway.
        self.nid = random_node_id();

        let stored = self.bootstrap.contacts();
        for node in &stored {
            self.send_find_node(SocketAddr::V4(node.addr), Some(node.nid)).await;
        }

        let mut sent = stored.len();
        for &host in self.bootstrap.fallback_hosts() {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => {
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        self.send_find_node(addr, None).await;
                        sent += 1;
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, host, "dht: bootstrap resolve failed");
                }
            }
        }
        tracing::info!(probes = sent, "dht: joining");
    }

    async fn send_find_node(&mut self, addr: SocketAddr, nid: Option<[u8; 20]>) {
        let own = match nid {
            Some(nid) => neighbor_id(&nid),
            None => self.nid,
        };
        let msg = Value::Dict(vec![
            (
                b"a".to_vec(),
                Value::Dict(vec![
                    (b"id".to_vec(), Value::bytes(&own[..])),
                    (b"target".to_vec(), Value::bytes(&random_node_id()[..])),
                ]),
            ),
            (b"q".to_vec(), Value::bytes(&b"find_node"[..])),
            (b"t".to_vec(), Value::bytes(&entropy(2)[..])),
            (b"y".to_vec(), Value::bytes(&b"q"[..])),
        ]);
        self.send_to(&msg, addr).await;
    }

    async fn send(&mut self, msg: &Value, to: SocketAddrV4) {
        self.send_to(msg, SocketAddr::V4(to)).await;
    }

    async fn send_to(&mut self, msg: &Value, to: SocketAddr) {
        let Ok(payload) = bencode::encode(msg) else {
            return;
        };
        match self.socket.send_to(&payload, to).await {
            Ok(_) => self.tx += 1,
            Err(err) => tracing::debug!(%err, %to, "dht: send failed"),
        }
    }

    fn push_node(&mut self, node: KNode) {
        if node.addr.port() == 0 || !is_publicly_routable(*node.addr.ip()) {
            return;
        }
        // Duplicates are tolerated; the deque churns fast enough that hard
        // dedup buys nothing.
        if self.nodes.len() >= self.cfg.dht_max_node_qsize {
            self.nodes.pop_front();
        }
        self.nodes.push_back(node);
    }

    fn sample_nodes(&self, k: usize) -> Vec<KNode> {
        use rand::seq::IteratorRandom;
        let mut rng = rand::thread_rng();
        self.nodes.iter().copied().choose_multiple(&mut rng, k)
    }

    fn persist_if_healthy(&mut self) {
        if self.nodes.len() >= self.cfg.dht_max_node_qsize / 2 {
            self.bootstrap.persist();
        }
    }

    fn token_for(&self, addr: SocketAddrV4) -> [u8; 8] {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(&addr.ip().octets());
        key[4..].copy_from_slice(&addr.port().to_be_bytes());
        xxhash_rust::xxh3::xxh3_64_with_seed(&key, self.token_secret).to_be_bytes()
    }
}

/// First 19 bytes of `other`, one random byte: close enough to rank first in
/// the asker's bucket, distinct enough to not collide with it.
pub fn neighbor_id(other: &[u8; 20]) -> [u8; 20] {
    let mut out = *other;
    out[19] = rand::thread_rng().next_u32() as u8;
    out
}

pub fn random_node_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn entropy(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn as_id20(raw: &[u8]) -> Option<[u8; 20]> {
    let mut out = [0u8; 20];
    if raw.len() != 20 {
        return None;
    }
    out.copy_from_slice(raw);
    Some(out)
}

/// Compact node list: 26 bytes per node (20 id + 4 IPv4 + 2 port). A length
/// that is not a multiple of 26 means a mangled response; reject it whole.
pub fn parse_compact_nodes(raw: &[u8]) -> Option<Vec<KNode>> {
    if raw.len() % COMPACT_NODE_LEN != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    for chunk in raw.chunks_exact(COMPACT_NODE_LEN) {
        let Some(nid) = as_id20(&chunk[..20]) else {
            return None;
        };
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        out.push(KNode {
            nid,
            addr: SocketAddrV4::new(ip, port),
        });
    }
    Some(out)
}

fn is_publicly_routable(ip: Ipv4Addr) -> bool {
    if ip.is_private() || ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    if ip.is_link_local() || ip.is_multicast() || ip.is_broadcast() {
        return false;
    }

    // Documentation and benchmark ranges.
    let o = ip.octets();
    if (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)
        || (o[0] == 198 && (o[1] == 18 || o[1] == 19))
    {
        return false;
    }

    true
}

fn reply_dict(tid: &[u8], r: Vec<(Vec<u8>, Value)>) -> Value {
    Value::Dict(vec![
        (b"r".to_vec(), Value::Dict(r)),
        (b"t".to_vec(), Value::bytes(tid)),
        (b"y".to_vec(), Value::bytes(&b"r"[..])),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_id_keeps_19_byte_prefix() {
        let target = [0xAA; 20];
        let spoof = neighbor_id(&target);
        assert_eq!(spoof[..19], target[..19]);
    }

    #[test]
    fn compact_nodes_parse_in_26_byte_units() {
        let mut raw = Vec::new();
        for i in 0..3u8 {
            raw.extend_from_slice(&[i; 20]);
            raw.extend_from_slice(&[1, 2, 3, 4 + i]);
            raw.extend_from_slice(&(6881u16 + i as u16).to_be_bytes());
        }
        let nodes = parse_compact_nodes(&raw).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].nid, [0u8; 20]);
        assert_eq!(*nodes[2].addr.ip(), Ipv4Addr::new(1, 2, 3, 6));
        assert_eq!(nodes[1].addr.port(), 6882);
    }

    #[test]
    fn compact_nodes_reject_partial_records() {
        assert!(parse_compact_nodes(&[0u8; 25]).is_none());
        assert!(parse_compact_nodes(&[0u8; 27]).is_none());
        assert_eq!(parse_compact_nodes(&[]).map(|v| v.len()), Some(0));
    }

    #[test]
    fn routability_filter() {
        assert!(is_publicly_routable(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_publicly_routable(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_publicly_routable(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_publicly_routable(Ipv4Addr::new(192, 0, 2, 9)));
        assert!(!is_publicly_routable(Ipv4Addr::new(198, 18, 0, 1)));
    }

    #[test]
    fn krpc_reply_is_canonical() {
        let reply = reply_dict(b"aa", vec![(b"id".to_vec(), Value::bytes(&[b'x'; 20][..]))]);
        let encoded = bencode::encode(&reply).unwrap();
        assert_eq!(
            encoded,
            b"d1:rd2:id20:xxxxxxxxxxxxxxxxxxxxe1:t2:aa1:y1:re".to_vec()
        );
    }
}
