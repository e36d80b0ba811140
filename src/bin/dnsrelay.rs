use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use getopts::{Matches, Options};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use dnsrelay::dns::context::{parse_upstream, LoopMode, RelayConfig};
use dnsrelay::dns::server::RelayServer;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn log_level(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn parse_opt<T: std::str::FromStr>(matches: &Matches, name: &str) -> Result<Option<T>, String> {
    match matches.opt_str(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("Invalid value for --{}: {}", name, value)),
        None => Ok(None),
    }
}

fn build_config(matches: &Matches) -> Result<RelayConfig, String> {
    let mut config = RelayConfig::default();

    if let Some(server) = matches.opt_str("s") {
        config.upstream = parse_upstream(&server).map_err(|e| e.to_string())?;
    }

    if let Some(mode) = matches.opt_str("m") {
        config.mode = LoopMode::from_arg(&mode).map_err(|e| e.to_string())?;
    }

    if let Some(path) = matches.opt_str("p") {
        config.hosts_path = PathBuf::from(path);
    }

    if matches.opt_present("l") {
        config.enable_query_log();
    }

    if let Some(path) = matches.opt_str("log-path") {
        config.query_log_path = Some(PathBuf::from(path));
    }

    if let Some(port) = parse_opt::<u16>(matches, "port")? {
        config.listen_port = port;
    }

    if let Some(size) = parse_opt::<usize>(matches, "cache-size")? {
        config.cache_capacity = size;
    }

    if let Some(timeout) = parse_opt::<i64>(matches, "id-timeout")? {
        config.id_lifetime = timeout;
    }

    config.validate().map_err(|e| e.to_string())?;

    Ok(config)
}

/// Main entry point for the relay
fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt(
        "s",
        "server",
        "Upstream DNS server (e.g. 8.8.8.8 or 8.8.8.8:53)",
        "ADDR",
    );
    opts.optopt(
        "m",
        "mode",
        "0 for the polling loop, 1 for the event driven loop",
        "MODE",
    );
    opts.optopt("p", "hosts", "Path to the hosts file", "PATH");
    opts.optflag("l", "query-log", "Log answered queries to ./log.txt");
    opts.optopt(
        "",
        "log-path",
        "Log answered queries to the given file",
        "PATH",
    );
    opts.optflagmulti(
        "d",
        "debug",
        "Increase verbosity, -d for info and -dd for debug output",
    );
    opts.optopt("", "port", "Port to listen on", "PORT");
    opts.optopt("", "cache-size", "Number of domains to cache", "N");
    opts.optopt(
        "",
        "id-timeout",
        "Seconds to wait for an upstream answer",
        "SECS",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(&program, opts);
            process::exit(2);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let level = log_level(opt_matches.opt_count("d"));
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let config = match build_config(&opt_matches) {
        Ok(x) => x,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let relay = match config.build_relay() {
        Ok(x) => x,
        Err(e) => {
            log::error!(
                "Failed to start relay (hosts file {}): {}",
                config.hosts_path.display(),
                e
            );
            process::exit(1);
        }
    };

    let listen = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let server = match RelayServer::bind(relay, listen, config.upstream) {
        Ok(x) => x,
        Err(e) => {
            log::error!("Failed to bind {}: {}", listen, e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run(config.mode) {
        log::error!("Server failed: {}", e);
        process::exit(1);
    }
}
