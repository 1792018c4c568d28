//! Edge host binary.

use clap::Parser;
use server::{Config, EdgeHost};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "edge-host")]
#[command(about = "Edge-side service-hosting platform")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    server::logging::init(&config.logging);
    let shutdown = server::signal::install_shutdown_handler();

    match EdgeHost::start(&config) {
        Ok(host) => host.run_until(shutdown),
        Err(e) => {
            eprintln!("Host error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_default_config() {
    let config = r#"# Edge host configuration

[listen]
# TCP listen address for framed client traffic
address = "127.0.0.1:7680"

[flow]
# Flow instance name; also names the worker thread
name = "edge-host"

# Bounded event queue capacity; publishes beyond this are rejected
queue_capacity = 1024

[frame]
# Maximum accepted frame payload in bytes
max_payload = 4194304

[logging]
# Level filter when RUST_LOG is unset: "trace".."error"
level = "info"

# Output format: "pretty", "json", or "compact"
format = "pretty"
timestamps = true
target = false
thread_names = true

# Bus channels created at startup
# [[channel]]
# name = "workers"
# kind = "publish_subscribe"   # point_to_point, publish_subscribe,
#                              # request_response, broadcast, multicast
# subscribe = ["inference.*"]

# Topic routes binding channels to topics
# [[route]]
# topic = "inference.request"
# channels = ["workers"]
"#;
    print!("{}", config);
}
