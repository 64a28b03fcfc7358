//! Deployment health probe.
//!
//! Loads the same configuration file as the server (including the
//! `TREELINE_DB` environment override), so the probe always targets the
//! database, stream, and group the server actually runs against. Healthy
//! iff the event log answers a liveness probe and the dispatcher's
//! consumer group exists on the stream. Exit code 0 when healthy, 1 when
//! degraded, so it slots into container health checks as-is.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use treeline_core::log::{self, EventLog};
use treeline_server::config::ConfigLoader;

/// Treeline health check
#[derive(Parser, Debug)]
#[command(name = "treeline-health")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (the one the server reads)
    #[arg(short, long, default_value = "./treeline.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match ConfigLoader::new(&args.config, None).load() {
        Ok(settings) => settings,
        Err(e) => {
            println!("configuration: INVALID ({e})");
            return ExitCode::from(1);
        }
    };

    let log = match log::connect(&settings.database_url).await {
        Ok(pool) => EventLog::new(pool, &settings.stream),
        Err(e) => {
            println!("event log: OFFLINE ({e})");
            return ExitCode::from(1);
        }
    };

    let log_ok = match log.ping().await {
        Ok(()) => {
            match log.stats().await {
                Ok(stats) => println!("event log: ONLINE ({} events)", stats.length),
                Err(_) => println!("event log: ONLINE"),
            }
            true
        }
        Err(e) => {
            println!("event log: OFFLINE ({e})");
            false
        }
    };

    let group = &settings.dispatcher.group;
    let group_ok = match log.group_exists(group).await {
        Ok(true) => {
            println!("consumer group '{group}': PRESENT");
            true
        }
        Ok(false) => {
            println!("consumer group '{group}': MISSING");
            false
        }
        Err(e) => {
            println!("consumer group '{group}': UNKNOWN ({e})");
            false
        }
    };

    if log_ok && group_ok {
        println!("all systems healthy");
        ExitCode::from(0)
    } else {
        println!("some systems need attention");
        ExitCode::from(1)
    }
}
