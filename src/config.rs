use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    // Process
    pub bind: SocketAddrV4,
    pub state_dir: PathBuf,
    pub user_agent: String,

    // Outputs
    pub print_only: bool,
    pub magnet_log: PathBuf,
    pub save_torrents: bool,
    pub torrent_dir: PathBuf,

    // DHT engine
    pub dht_max_node_qsize: usize,
    pub dht_outbound_rate: u64,
    pub dht_rejoin_interval_secs: u64,
    pub dht_rejoin_low_water: usize,
    pub dht_persist_interval_secs: u64,

    // Scheduler
    pub sched_queue_capacity: usize,
    pub sched_seen_window_secs: u64,
    pub sched_seen_bits_pow2: u32,
    pub sched_seen_hashes: u8,
    pub sched_fail_threshold: u32,
    pub sched_fail_cooldown_secs: u64,
    pub sched_bad_peer_secs: u64,
    pub sched_pool_hints: usize,
    pub sched_shutdown_grace_secs: u64,

    // Metadata workers
    pub worker_concurrency: usize,
    pub worker_connect_timeout_secs: u64,
    pub worker_recv_timeout_secs: u64,
    pub worker_max_metadata_bytes: usize,

    // Stores
    pub pool_capacity: usize,
    pub pool_ttl_secs: u64,
    pub bootstrap_capacity: usize,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: CLI flag > process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let bind_raw = env_string("MAGPIE_BIND", "0.0.0.0:6881");
        let bind = SocketAddrV4::from_str(&bind_raw)
            .map_err(|e| anyhow::anyhow!("parse MAGPIE_BIND ({bind_raw}): {e}"))?;

        Ok(Self {
            bind,
            state_dir: env_pathbuf("MAGPIE_STATE_DIR", "state"),
            user_agent: env_string("MAGPIE_USER_AGENT", concat!("magpie/", env!("CARGO_PKG_VERSION"))),

            print_only: false,
            magnet_log: env_pathbuf("MAGPIE_MAGNET_LOG", "hash.log"),
            save_torrents: env_enabled("MAGPIE_SAVE_TORRENTS", true),
            torrent_dir: env_pathbuf("MAGPIE_TORRENT_DIR", "BT"),

            dht_max_node_qsize: env_usize("MAGPIE_DHT_MAX_NODE_QSIZE", 1000),
            dht_outbound_rate: env_u64("MAGPIE_DHT_OUTBOUND_RATE", 200),
            dht_rejoin_interval_secs: env_u64("MAGPIE_DHT_REJOIN_INTERVAL_SECS", 3),
            dht_rejoin_low_water: env_usize("MAGPIE_DHT_REJOIN_LOW_WATER", 8),
            dht_persist_interval_secs: env_u64("MAGPIE_DHT_PERSIST_INTERVAL_SECS", 60),

            sched_queue_capacity: env_usize("MAGPIE_QUEUE_CAPACITY", 10_000),
            sched_seen_window_secs: env_u64("MAGPIE_SEEN_WINDOW_SECS", 10 * 60),
            sched_seen_bits_pow2: env_u32("MAGPIE_SEEN_BITS_POW2", 24),
            sched_seen_hashes: env_u8("MAGPIE_SEEN_HASHES", 8),
            sched_fail_threshold: env_u32("MAGPIE_FAIL_THRESHOLD", 20),
            sched_fail_cooldown_secs: env_u64("MAGPIE_FAIL_COOLDOWN_SECS", 10 * 60),
            sched_bad_peer_secs: env_u64("MAGPIE_BAD_PEER_SECS", 15 * 60),
            sched_pool_hints: env_usize("MAGPIE_POOL_HINTS", 5),
            sched_shutdown_grace_secs: env_u64("MAGPIE_SHUTDOWN_GRACE_SECS", 5),

            worker_concurrency: env_usize("MAGPIE_WORKERS", 100),
            worker_connect_timeout_secs: env_u64("MAGPIE_CONNECT_TIMEOUT_SECS", 15),
            worker_recv_timeout_secs: env_u64("MAGPIE_RECV_TIMEOUT_SECS", 15),
            worker_max_metadata_bytes: env_usize("MAGPIE_MAX_METADATA_BYTES", 10 * 1024 * 1024),

            pool_capacity: env_usize("MAGPIE_POOL_CAPACITY", 4096),
            pool_ttl_secs: env_u64("MAGPIE_POOL_TTL_SECS", 24 * 60 * 60),
            bootstrap_capacity: env_usize("MAGPIE_BOOTSTRAP_CAPACITY", 200),
        })
    }

    #[cfg(test)]
    pub fn default_for_tests() -> Self {
        Self {
            bind: SocketAddrV4::from_str("0.0.0.0:6881").unwrap(),
            state_dir: PathBuf::from("state"),
            user_agent: "magpie/test".to_string(),
            print_only: true,
            magnet_log: PathBuf::from("hash.log"),
            save_torrents: false,
            torrent_dir: PathBuf::from("BT"),
            dht_max_node_qsize: 1000,
            dht_outbound_rate: 200,
            dht_rejoin_interval_secs: 3,
            dht_rejoin_low_water: 8,
            dht_persist_interval_secs: 60,
            sched_queue_capacity: 10_000,
            sched_seen_window_secs: 600,
            sched_seen_bits_pow2: 16,
            sched_seen_hashes: 8,
            sched_fail_threshold: 20,
            sched_fail_cooldown_secs: 600,
            sched_bad_peer_secs: 900,
            sched_pool_hints: 5,
            sched_shutdown_grace_secs: 5,
            worker_concurrency: 100,
            worker_connect_timeout_secs: 15,
            worker_recv_timeout_secs: 15,
            worker_max_metadata_bytes: 10 * 1024 * 1024,
            pool_capacity: 4096,
            pool_ttl_secs: 24 * 60 * 60,
            bootstrap_capacity: 200,
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u8(name: &str, default: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
