use crate::{
    origin::{AllowAll, AllowList, OriginPolicy},
    session::Timeouts,
    sweeper::SweepConfig,
};
use clap::Parser;
use std::{sync::Arc, time::Duration};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8090;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXPIRY_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub port: u16,
    pub access_token: String,
    pub connect_timeout: Duration,
    pub expiry_timeout: Duration,
    pub sweep_interval: Duration,
    pub allowed_origins: Vec<String>,
    pub queue_capacity: usize,
    pub debug: bool,
    pub log_dir: String,
}

#[derive(Parser, Debug, Default)]
#[command(name = "signal-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub host: String,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value = "")]
    pub access_token: String,
    #[arg(long)]
    pub connect_timeout: Option<u64>,
    #[arg(long)]
    pub expiry_timeout: Option<u64>,
    #[arg(long)]
    pub sweep_interval: Option<u64>,
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

impl Config {
    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            interval: self.sweep_interval,
            timeouts: Timeouts {
                connect: self.connect_timeout,
                expiry: self.expiry_timeout,
            },
        }
    }

    pub fn origin_policy(&self) -> Arc<dyn OriginPolicy> {
        if self.allowed_origins.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(AllowList::new(&self.allowed_origins))
        }
    }
}

pub fn load_config() -> Config {
    from_args(Args::parse(), |key| std::env::var(key).ok())
}

pub fn from_args(args: Args, env: impl Fn(&str) -> Option<String>) -> Config {
    let host = resolve_str(&args.host, env("SIGNAL_HOST"), DEFAULT_HOST);
    let port = args
        .port
        .or_else(|| parse_env(env("SIGNAL_PORT")))
        .unwrap_or(DEFAULT_PORT);
    let access_token = resolve_str(&args.access_token, env("SIGNAL_ACCESS_TOKEN"), "");
    let connect_timeout = resolve_secs(
        args.connect_timeout,
        env("SIGNAL_CONNECT_TIMEOUT"),
        DEFAULT_CONNECT_TIMEOUT_SECS,
    );
    let expiry_timeout = resolve_secs(
        args.expiry_timeout,
        env("SIGNAL_EXPIRY_TIMEOUT"),
        DEFAULT_EXPIRY_TIMEOUT_SECS,
    );
    let sweep_interval = resolve_secs(
        args.sweep_interval,
        env("SIGNAL_SWEEP_INTERVAL"),
        DEFAULT_SWEEP_INTERVAL_SECS,
    )
    .max(Duration::from_secs(1));
    let mut allowed_origins = args.allowed_origins;
    if allowed_origins.is_empty() {
        if let Some(value) = env("SIGNAL_ALLOWED_ORIGINS") {
            allowed_origins = value
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
    }
    let debug = args.debug || env_true(env("SIGNAL_HUB_DEBUG"));
    let log_dir = resolve_str(&args.log_dir, env("SIGNAL_LOG_DIR"), "");
    Config {
        addr: format!("{host}:{port}"),
        port,
        access_token,
        connect_timeout,
        expiry_timeout,
        sweep_interval,
        allowed_origins,
        queue_capacity: args.queue_capacity.max(1),
        debug,
        log_dir,
    }
}

fn resolve_str(flag: &str, env_value: Option<String>, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    match env_value {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn resolve_secs(flag: Option<u64>, env_value: Option<String>, default: u64) -> Duration {
    Duration::from_secs(flag.or_else(|| parse_env(env_value)).unwrap_or(default))
}

fn parse_env<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|value| value.trim().parse().ok())
}

fn env_true(value: Option<String>) -> bool {
    match value {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}
