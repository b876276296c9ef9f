use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use csd_engine::{EngineConfig, RecoveryPolicy};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

mod workload;

use workload::{build_engine, drive, Workload};

#[derive(Debug, Parser)]
#[command(name = "csd-engine-cli", version)]
#[command(about = "Run the csd command engine against a simulated accelerator", long_about = None)]
struct Args {
    /// JSON engine configuration. Built-in defaults apply when unset.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Number of commands to run before stopping.
    #[arg(long, default_value_t = 10_000)]
    ops: u64,
    /// Seed for the workload generator.
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Share of reads in the workload, in percent.
    #[arg(long, default_value_t = 70, value_parser = clap::value_parser!(u8).range(0..=100))]
    read_percent: u8,
    /// Override the number of tokens.
    #[arg(long)]
    tokens: Option<u16>,
    /// Override the timeout recovery policy.
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
    /// Bind read buffers at allocation instead of matching markers.
    #[arg(long)]
    direct: bool,
    /// Serve Prometheus metrics on this port. 0 disables the listener.
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Abort,
    ResetRetry,
    MigrateRetry,
    Die,
}

impl From<PolicyArg> for RecoveryPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Abort => RecoveryPolicy::Abort,
            PolicyArg::ResetRetry => RecoveryPolicy::ResetRetry,
            PolicyArg::MigrateRetry => RecoveryPolicy::MigrateRetry,
            PolicyArg::Die => RecoveryPolicy::Die,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        tokens = config.tokens,
        mce_free = config.mce_free,
        policy = ?config.effective_policy(),
        ops = args.ops,
        seed = args.seed,
        "csd engine configured"
    );
    if args.metrics_port != 0 {
        install_metrics(args.metrics_port)?;
    }

    let mut workload = Workload::new(&config, args.ops, args.seed, args.read_percent);
    let mut engine = build_engine(config)?;
    let stop = Arc::new(AtomicBool::new(false));
    let mut task = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || drive(&mut engine, &mut workload, &stop)
    });

    let summary = tokio::select! {
        joined = &mut task => joined,
        interrupt = signal::ctrl_c() => {
            interrupt.context("listen for ctrl-c")?;
            info!("interrupt received");
            stop.store(true, Ordering::Relaxed);
            task.await
        }
    }
    .context("workload task panicked")??;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("encode summary")?
    );
    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => read_config(path)?,
        None => {
            debug!("no config file; using defaults");
            EngineConfig::default()
        }
    };
    if let Some(tokens) = args.tokens {
        config.tokens = tokens;
    }
    if let Some(policy) = args.policy {
        config.recovery.policy = policy.into();
    }
    if args.direct {
        config.mce_free = false;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

fn install_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install Prometheus metrics exporter")?;
    info!(%addr, "metrics listener started");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        Args::parse_from(std::iter::once("csd-engine-cli").chain(extra.iter().copied()))
    }

    #[test]
    fn defaults_without_config_file() {
        let config = load_config(&args(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn file_values_and_flag_overrides_combine() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tokens": 32, "recovery": {{"policy": "abort", "max_resets": 5}}}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_owned();

        let config = load_config(&args(&["--config", &path])).unwrap();
        assert_eq!(config.tokens, 32);
        assert_eq!(config.recovery.policy, RecoveryPolicy::Abort);
        assert_eq!(config.recovery.max_resets, 5);
        assert!(config.mce_free);

        let config = load_config(&args(&[
            "--config",
            &path,
            "--tokens",
            "48",
            "--policy",
            "migrate-retry",
            "--direct",
        ]))
        .unwrap();
        assert_eq!(config.tokens, 48);
        assert_eq!(config.recovery.policy, RecoveryPolicy::MigrateRetry);
        assert!(!config.mce_free);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tokenz": 8}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let err = load_config(&args(&["--config", &path])).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }

    #[test]
    fn invalid_overrides_fail_validation() {
        let err = load_config(&args(&["--tokens", "1"])).unwrap_err();
        assert!(format!("{err:#}").contains("invalid engine configuration"));
    }

    #[test]
    fn missing_config_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = load_config(&args(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }
}
