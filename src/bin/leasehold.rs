//! Leasehold demo - acquire a lock in etcd, hold it, release it.
//!
//! Connection settings come from `ETCD_ENDPOINTS`, `ETCD_USERNAME`,
//! `ETCD_PASSWORD` and `ETCD_REQUEST_TIMEOUT`; lock settings from the
//! `LEASEHOLD_*` variables.

use clap::Parser;
use leasehold::{
    DistributedLock, EtcdConfig, EtcdStore, LeaseLock, LockConfig, LockError, ReleaseOutcome,
};
use std::fmt::Display;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Hold a distributed lock for a while
#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Acquire a lease-backed lock in etcd, hold it, then release it")]
struct Cli {
    /// Lock name
    #[arg(long, default_value = "my-lock")]
    lock: String,

    /// Holder identity written into the lock record (random when omitted)
    #[arg(long, env = "LEASEHOLD_HOLDER")]
    holder: Option<String>,

    /// Seconds to hold the lock once acquired
    #[arg(long, default_value_t = 5)]
    hold_secs: u64,

    /// Give up waiting for the lock after this many seconds
    #[arg(long)]
    wait_secs: Option<u64>,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.log_level.as_deref() {
        Some(level) => leasehold::init_tracing_with_level(level),
        None => leasehold::init_tracing(),
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "leasehold failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), LockError> {
    let config = LockConfig::from_env().build();
    let store = EtcdStore::new(EtcdConfig::from_env().build())?;
    info!(endpoint = store.current_endpoint(), "Connecting to etcd");

    let mut builder = LeaseLock::builder(cli.lock).with_config(config);
    if let Some(holder) = cli.holder {
        builder = builder.with_holder(holder);
    }
    let lock = builder.build(Arc::new(store))?;

    let mut handle = match cli.wait_secs {
        Some(secs) => lock.acquire_timeout(Duration::from_secs(secs)).await?,
        None => {
            lock.acquire_until(signalled(tokio::signal::ctrl_c()))
                .await?
        }
    };

    info!(
        lock = handle.name(),
        holder = handle.holder(),
        token = %handle.fencing_token(),
        "Holding lock"
    );

    // Simulate a critical section
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.hold_secs)) => {}
        reason = handle.lost() => warn!(%reason, "Lock lost before the critical section finished"),
        _ = signalled(tokio::signal::ctrl_c()) => info!("Interrupted, releasing early"),
    }

    match handle.release().await? {
        ReleaseOutcome::Released => info!(lock = handle.name(), "Lock released"),
        ReleaseOutcome::LostOwnership => {
            warn!(lock = handle.name(), "Lock record was taken over before release")
        }
        ReleaseOutcome::AlreadyReleased => {}
    }

    Ok(())
}

/// Resolves once `signal` fires. A signal that could not be installed never fires.
async fn signalled<E: Display>(signal: impl Future<Output = Result<(), E>>) {
    if let Err(e) = signal.await {
        warn!(error = %e, "Cannot listen for Ctrl-C; continuing without interruption");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_handler_never_interrupts() {
        let failed = async { Err::<(), _>(std::io::Error::other("no signal driver")) };
        let waited = tokio::time::timeout(Duration::from_secs(60), signalled(failed)).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_signal_interrupts() {
        let delivered = async { Ok::<(), std::io::Error>(()) };
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), signalled(delivered)).await
        );
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["leasehold"]);
        assert_eq!(cli.lock, "my-lock");
        assert_eq!(cli.hold_secs, 5);
        assert!(cli.wait_secs.is_none());
    }
}
