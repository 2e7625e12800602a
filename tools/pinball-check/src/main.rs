// Copyright 2020 Joyent, Inc.

//
// Resolves each address given on the command line and prints the result. With
// -c, also checks a connection to each address out of a pinball pool, checks
// it back in and prints the pool's stats.
//
// The -l argument is useful for controlling the amount of log spam. Set it to
// "critical" to see only the results.
//

mod util;

use std::cell::Cell;

use clap::{App, Arg};
use slog::{crit, debug, error, info, trace, warn, Level, Logger};

use pinball::address::{Address, Node, NodeEvent};
use pinball::connection_pool::types::ConnectionPoolOptions;
use pinball::connection_pool::ConnectionPool;
use pinball::owner::{ThreadLiveness, ThreadOwner};
use pinball_tcp_stream_connection::StreamConnection;

const DEFAULT_MAX_SIZE: &str = "4";
const DEFAULT_TIMEOUT: &str = "1000";

// A node that logs what its addresses report and remembers being marked down.
struct EchoNode {
    log: Logger,
    down: Cell<bool>,
}

impl Node for EchoNode {
    fn instrument(&self, level: Level, event: NodeEvent) {
        match level {
            Level::Critical => crit!(self.log, "{}", event),
            Level::Error => error!(self.log, "{}", event),
            Level::Warning => warn!(self.log, "{}", event),
            Level::Info => info!(self.log, "{}", event),
            Level::Debug => debug!(self.log, "{}", event),
            Level::Trace => trace!(self.log, "{}", event),
        }
    }

    fn down(&self) {
        self.down.set(true);
    }
}

struct CheckArgs {
    addresses: Vec<String>,
    checkout: bool,
    max_size: u32,
    timeout: u64,
}

fn main() {
    let matches = App::new("Pinball Check CLI")
        .version("0.1.0")
        .about("Resolves addresses and checks connections out of a pool")
        .arg(
            Arg::with_name("address")
                .required(true)
                .multiple(true)
                .help("host:port pair or unix-domain socket path"),
        )
        .arg(
            Arg::with_name("checkout")
                .short("c")
                .long("checkout")
                .help("Check a connection to each address out of a pool"),
        )
        .arg(
            Arg::with_name("max size")
                .short("m")
                .long("max-size")
                .takes_value(true)
                .default_value(DEFAULT_MAX_SIZE)
                .help("Maximum number of pool connections"),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT)
                .help("Connect and checkout timeout in milliseconds"),
        )
        .arg(
            Arg::with_name("log level")
                .short("l")
                .long("log-level")
                .takes_value(true)
                .help(
                    format!(
                        "Log level: trace|debug|info|warning|error|critical\n\
                         (uses {} env var if flag not given)\n\
                         (default: {})",
                        util::LOG_LEVEL_ENV_VAR,
                        format!("{:?}", util::DEFAULT_LOG_LEVEL).to_lowercase()
                    )
                    .as_str(),
                ),
        )
        .get_matches();

    let addresses: Vec<String> = matches
        .values_of("address")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();
    let max_size = matches
        .value_of("max size")
        .unwrap_or(DEFAULT_MAX_SIZE)
        .parse::<u32>()
        .expect("Invalid max size");
    let timeout = matches
        .value_of("timeout")
        .unwrap_or(DEFAULT_TIMEOUT)
        .parse::<u64>()
        .expect("Invalid timeout");

    //
    // Try to get the log level from the CLI arg and, if that fails, the
    // environment variable. If both fail, just use the default.
    //
    let l = match matches.value_of("log level") {
        Some(level_str) => {
            util::parse_log_level(level_str).expect("Invalid log level")
        }
        None => util::log_level_from_env()
            .expect("Invalid log level")
            .unwrap_or(util::DEFAULT_LOG_LEVEL),
    };

    let args = CheckArgs {
        addresses,
        checkout: matches.is_present("checkout"),
        max_size,
        timeout,
    };

    std::process::exit(match run(args, l) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    });
}

fn run(args: CheckArgs, l: Level) -> Result<(), String> {
    let log = util::standard_log(l);
    let mut failures = 0;

    for addr in args.addresses.iter() {
        let address = Address::new(addr.as_str());
        let node = EchoNode {
            log: log.clone(),
            down: Cell::new(false),
        };
        match address.resolve(&node) {
            Some(resolved) => println!("{} resolved to {}", address, resolved),
            None => {
                println!("{} could not be resolved (node down)", address);
                failures += 1;
            }
        }
        debug!(log, "node state"; "address" => addr, "down" => node.down.get());
    }

    if args.checkout {
        failures += check_connections(&args, &log);
    }

    if failures > 0 {
        return Err(format!("{} of the checks failed", failures));
    }
    Ok(())
}

fn check_connections(args: &CheckArgs, log: &Logger) -> usize {
    let pool_opts = ConnectionPoolOptions {
        max_size: Some(args.max_size),
        checkout_timeout: Some(args.timeout),
        connect_timeout: Some(args.timeout),
        log: Some(log.clone()),
        ..Default::default()
    };
    let pool = ConnectionPool::<StreamConnection, ThreadOwner>::new(
        pool_opts,
        ThreadLiveness,
    );
    let owner = ThreadOwner::current();
    let mut failures = 0;

    for addr in args.addresses.iter() {
        match pool.checkout(&owner, addr) {
            Ok(conn) => {
                println!(
                    "{}: checked out connection {} to {}",
                    addr,
                    conn.id(),
                    conn.lock().peer()
                );
                pool.checkin(conn);
            }
            Err(err) => {
                println!("{}: {}", addr, err);
                failures += 1;
            }
        }
    }

    let stats = pool.get_stats();
    println!(
        "pool: {} connections, {} idle, {} pinned, {} unpinned",
        stats.total_connections,
        stats.idle_connections,
        stats.pinned_connections,
        stats.unpinned_connections
    );
    pool.reset();
    failures
}
