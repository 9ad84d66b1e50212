//! `rpoolctl`: the operational CLI shipped alongside the pool (spec §6).
//! Starts, stops, or probes one or more backend compute servers without
//! going through an application's own pool instance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use rstat_pool::config::{PoolConfig, PoolEntry};
use rstat_pool::driver::{Driver, RserveDriver};
use rstat_pool::endpoint::ServerEndpoint;

#[derive(Parser, Debug)]
#[command(name = "rpoolctl", about = "Start, stop, or probe remote compute backends")]
#[command(group(
    ArgGroup::new("action").required(true).args(["startup", "shutdown", "validate"])
))]
struct Args {
    /// Launch the configured backend(s).
    #[arg(long)]
    startup: bool,

    /// Send the shutdown command to the configured backend(s).
    #[arg(long)]
    shutdown: bool,

    /// Report UP/DOWN for the configured backend(s).
    #[arg(long)]
    validate: bool,

    /// A single backend host, used when `--configuration` is not given.
    #[arg(long)]
    host: Option<String>,

    /// Port for the ad hoc `--host`, default 6311.
    #[arg(long)]
    port: Option<u16>,

    /// Username for the ad hoc `--host`.
    #[arg(long)]
    username: Option<String>,

    /// Password for the ad hoc `--host`.
    #[arg(long)]
    password: Option<String>,

    /// Path to an `RConnectionPool.xml`-shaped document describing one or
    /// more backends.
    #[arg(long)]
    configuration: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    if config.entries.is_empty() {
        eprintln!("no backends configured");
        return ExitCode::from(2);
    }

    let driver = RserveDriver;
    if args.startup {
        run_startup(&driver, &config)
    } else if args.shutdown {
        run_shutdown(&driver, &config)
    } else {
        run_validate(&driver, &config)
    }
}

fn resolve_config(args: &Args) -> Result<PoolConfig, rstat_pool::PoolError> {
    if let Some(path) = &args.configuration {
        return rstat_pool::config::load_from_path(path);
    }
    let host = args.host.clone().unwrap_or_else(|| "localhost".to_string());
    let mut endpoint = ServerEndpoint::new(host, args.port.unwrap_or(rstat_pool::endpoint::DEFAULT_PORT));
    if let (Some(u), Some(p)) = (&args.username, &args.password) {
        endpoint = endpoint.with_credentials(u.clone(), p.clone());
    }
    Ok(PoolConfig::empty().with_entry(PoolEntry {
        endpoint,
        embedded: false,
        command: "Rserve".to_string(),
    }))
}

fn run_startup(driver: &RserveDriver, config: &PoolConfig) -> ExitCode {
    let mut failures = 0usize;
    for entry in &config.entries {
        match driver.startup(&entry.endpoint, &entry.command) {
            Ok(handle) => {
                // Detach: rpoolctl's job is to get the process running, not
                // to babysit it for the rest of its life.
                std::mem::drop(handle);
            }
            Err(e) => {
                eprintln!("{} startup failed: {e}", entry.endpoint);
                failures += 1;
            }
        }
    }
    ExitCode::from(exit_code_for_failures(failures, config.entries.len(), 2))
}

fn run_shutdown(driver: &RserveDriver, config: &PoolConfig) -> ExitCode {
    let mut failures = 0usize;
    for entry in &config.entries {
        if let Err(e) = driver.shutdown(&entry.endpoint) {
            eprintln!("{} shutdown failed: {e}", entry.endpoint);
            failures += 1;
        }
    }
    ExitCode::from(exit_code_for_failures(failures, config.entries.len(), 1))
}

fn run_validate(driver: &RserveDriver, config: &PoolConfig) -> ExitCode {
    let mut any_down = false;
    for entry in &config.entries {
        let up = driver.validate(&entry.endpoint);
        println!("{} is {}", entry.endpoint, if up { "UP" } else { "DOWN" });
        any_down |= !up;
    }
    if any_down {
        ExitCode::from(42)
    } else {
        ExitCode::SUCCESS
    }
}

/// Maps a `(failures, total)` count to the spec §6 exit-code contract.
/// `single_failure_code` is `2` for startup or `1` for shutdown: the code
/// used when the one configured host failed. Any multi-host configuration
/// with at least one failure maps to `3` regardless of which operation
/// failed.
fn exit_code_for_failures(failures: usize, total: usize, single_failure_code: u8) -> u8 {
    match (failures, total) {
        (0, _) => 0,
        (f, t) if f == t && t == 1 => single_failure_code,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_failures_is_success() {
        assert_eq!(exit_code_for_failures(0, 1, 2), 0);
        assert_eq!(exit_code_for_failures(0, 3, 1), 0);
    }

    #[test]
    fn single_host_failure_uses_operation_specific_code() {
        assert_eq!(exit_code_for_failures(1, 1, 2), 2);
        assert_eq!(exit_code_for_failures(1, 1, 1), 1);
    }

    #[test]
    fn multi_host_any_failure_is_three() {
        assert_eq!(exit_code_for_failures(1, 3, 2), 3);
        assert_eq!(exit_code_for_failures(2, 3, 1), 3);
    }

    #[test]
    fn multi_host_all_fail_is_three() {
        assert_eq!(exit_code_for_failures(3, 3, 2), 3);
    }
}
