mod bencode;
mod bootstrap;
mod config;
mod dht;
mod metadata;
mod peer_pool;
mod scheduler;
mod storage;

use crate::bootstrap::BootstrapStore;
use crate::config::Config;
use crate::dht::DhtEngine;
use crate::peer_pool::PeerPool;
use crate::storage::Storage;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Default)]
struct CliOptions {
    help: bool,
    print_only: bool,
    magnet_log: Option<PathBuf>,
    workers: Option<usize>,
    save_torrents: Option<bool>,
}

fn usage() {
    println!("magpie [options]");
    println!("  -s        Do not store files. Print only.");
    println!("  -p:FILE   Path for the magnet log (default hash.log).");
    println!("  -t:N      Max concurrent metadata downloads (default 100).");
    println!("  -b:0|1    0 = skip .torrent files, 1 = save them under BT/ (default 1).");
    println!("  -h        Print this help.");
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut opts = CliOptions::default();
    for arg in args {
        if arg == "-h" {
            opts.help = true;
        } else if arg == "-s" {
            opts.print_only = true;
        } else if let Some(rest) = arg.strip_prefix("-p:") {
            if rest.is_empty() {
                return Err("-p: needs a file path".to_string());
            }
            opts.magnet_log = Some(PathBuf::from(rest));
        } else if let Some(rest) = arg.strip_prefix("-t:") {
            let n: usize = rest
                .parse()
                .map_err(|_| format!("-t: needs a positive number, got {rest:?}"))?;
            if n == 0 {
                return Err("-t: needs a positive number".to_string());
            }
            opts.workers = Some(n);
        } else if let Some(rest) = arg.strip_prefix("-b:") {
            match rest {
                "0" => opts.save_torrents = Some(false),
                "1" => opts.save_torrents = Some(true),
                _ => return Err(format!("-b: takes 0 or 1, got {rest:?}")),
            }
        } else {
            return Err(format!("unrecognized option: {arg}"));
        }
    }
    Ok(opts)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            usage();
            std::process::exit(1);
        }
    };
    if cli.help {
        usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    cfg.print_only = cfg.print_only || cli.print_only;
    if let Some(path) = cli.magnet_log {
        cfg.magnet_log = path;
    }
    if let Some(workers) = cli.workers {
        cfg.worker_concurrency = workers;
    }
    if let Some(save) = cli.save_torrents {
        cfg.save_torrents = save;
    }
    let cfg = Arc::new(cfg);

    // The one unrecoverable failure: without the UDP socket there is no DHT.
    let socket = match UdpSocket::bind(cfg.bind).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(%err, bind = %cfg.bind, "fatal: failed to bind UDP socket");
            std::process::exit(2);
        }
    };
    tracing::info!(bind = %cfg.bind, workers = cfg.worker_concurrency, "magpie: listening");

    let pool = Arc::new(Mutex::new(PeerPool::load(
        cfg.state_dir.join("metadata_peers.jsonl"),
        Duration::from_secs(cfg.pool_ttl_secs),
        cfg.pool_capacity,
    )));
    let bootstrap_store = BootstrapStore::load(
        cfg.state_dir.join("bootstrap_nodes.jsonl"),
        cfg.bootstrap_capacity,
    );

    let (magnet_log, torrent_dir) = if cfg.print_only {
        (None, None)
    } else {
        (
            Some(cfg.magnet_log.clone()),
            cfg.save_torrents.then(|| cfg.torrent_dir.clone()),
        )
    };
    let storage = Arc::new(Storage::new(magnet_log, torrent_dir));

    let (sched, jobs) = scheduler::new(cfg.clone(), pool.clone(), storage);
    let engine = DhtEngine::new(cfg.clone(), socket, jobs, bootstrap_store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched_task = tokio::spawn(sched.run(shutdown_rx.clone()));
    let dht_task = tokio::spawn(engine.run(shutdown_rx));

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "signal wait failed");
    }
    tracing::info!("magpie: shutting down");
    let _ = shutdown_tx.send(true);

    let _ = dht_task.await; // persists the bootstrap store on the way out
    let _ = sched_task.await; // waits out the worker grace period

    pool.lock().expect("peer pool lock").persist();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_the_documented_flags() {
        let opts = parse_args(&args(&["-s", "-p:magnets.txt", "-t:32", "-b:0"])).unwrap();
        assert!(opts.print_only);
        assert_eq!(opts.magnet_log, Some(PathBuf::from("magnets.txt")));
        assert_eq!(opts.workers, Some(32));
        assert_eq!(opts.save_torrents, Some(false));
        assert!(!opts.help);
    }

    #[test]
    fn rejects_unknown_and_malformed_flags() {
        assert!(parse_args(&args(&["--nope"])).is_err());
        assert!(parse_args(&args(&["-t:zero"])).is_err());
        assert!(parse_args(&args(&["-t:0"])).is_err());
        assert!(parse_args(&args(&["-b:2"])).is_err());
        assert!(parse_args(&args(&["-p:"])).is_err());
    }

    #[test]
    fn help_flag_wins() {
        let opts = parse_args(&args(&["-h"])).unwrap();
        assert!(opts.help);
    }
}
