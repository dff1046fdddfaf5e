use crate::exposition::{UnitScaling, DEFAULT_SCALE_FACTOR};
use crate::pipeline::DEFAULT_TICK_PERIOD;
use crate::store::ReadingColumn;
use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::time::Duration;

const DEFAULT_SCRAPE_ADDRESS: &str = "http://127.0.0.1:9000/metrics";
const DEFAULT_BROKER_TOPIC: &str = "senstore/readings";

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "senstore",
    version,
    about = "daemon to push sensor data to a data sink (postgres / mqtt)"
)]
pub struct Args {
    /// address to scrape readings [default: http://127.0.0.1:9000/metrics]
    #[arg(short = 's', long)]
    pub scrape_address: Option<String>,
    /// scrape request timeout in seconds [default: 10]
    #[arg(long)]
    pub scrape_timeout_secs: Option<u64>,
    /// seconds between ticks [default: 15]
    #[arg(long)]
    pub interval_secs: Option<u64>,
    /// comma-separated metric name prefixes scaled before integer coercion
    #[arg(long)]
    pub scaled_prefixes: Option<String>,
    /// multiplier for scaled metrics [default: 1000]
    #[arg(long)]
    pub scale_factor: Option<f64>,
    /// database column to write readings to [default: reading]
    #[arg(short = 'c', long)]
    pub postgres_column: Option<String>,
    /// postgres connection string
    #[arg(short = 'p', long)]
    pub postgres_connect_string: Option<String>,
    /// comma-separated broker host:port list
    #[arg(long)]
    pub broker_bootstrap: Option<String>,
    #[arg(long)]
    pub broker_topic: Option<String>,
    #[arg(long)]
    pub broker_sa_key: Option<String>,
    #[arg(long)]
    pub broker_sa_secret: Option<String>,
    #[arg(long)]
    pub broker_client_id: Option<String>,
    #[arg(long)]
    pub broker_keepalive_secs: Option<u64>,
    /// connect to the broker without TLS
    #[arg(long, default_value_t = false)]
    pub broker_insecure: bool,
}

#[derive(Clone, Debug)]
pub struct ScrapeConfig {
    pub address: String,
    pub timeout: Duration,
    pub scaling: UnitScaling,
}

#[derive(Clone, Debug)]
pub struct RelationalConfig {
    pub connect_string: String,
    pub column: ReadingColumn,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub bootstrap: String,
    pub topic: String,
    pub sa_key: Option<String>,
    pub sa_secret: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub tls: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub scrape: ScrapeConfig,
    pub interval: Duration,
    pub relational: Option<RelationalConfig>,
    pub broker: Option<BrokerConfig>,
    pub otlp_endpoint: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::resolve(Args::parse(), |key| std::env::var(key).ok())
    }

    /// Non-empty flags win over non-empty environment values, which win over
    /// defaults.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |flag: Option<String>, key: &str| non_empty(flag).or_else(|| non_empty(env(key)));
        let pick_num = |flag: Option<u64>, key: &str| {
            flag.or_else(|| non_empty(env(key)).and_then(|v| v.parse::<u64>().ok()))
        };

        let factor = match non_empty(args.scale_factor.map(|f| f.to_string()))
            .or_else(|| non_empty(env("SCALE_FACTOR")))
        {
            Some(text) => text
                .parse::<f64>()
                .with_context(|| format!("invalid scale factor {text:?}"))?,
            None => DEFAULT_SCALE_FACTOR,
        };
        anyhow::ensure!(
            factor.is_finite() && factor > 0.0,
            "scale factor must be finite and positive, got {factor}"
        );

        let scaling = UnitScaling {
            prefixes: match pick(args.scaled_prefixes, "SCALED_PREFIXES") {
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => UnitScaling::default().prefixes,
            },
            factor,
        };

        let scrape = ScrapeConfig {
            address: pick(args.scrape_address, "SCRAPE_ADDRESS")
                .unwrap_or_else(|| DEFAULT_SCRAPE_ADDRESS.to_string()),
            timeout: Duration::from_secs(
                pick_num(args.scrape_timeout_secs, "SCRAPE_TIMEOUT_SECS").unwrap_or(10),
            ),
            scaling,
        };
        let interval = pick_num(args.interval_secs, "SCRAPE_INTERVAL_SECS")
            .filter(|secs| *secs != 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TICK_PERIOD);

        let relational = match pick(args.postgres_connect_string, "POSTGRES_CONNECT_STRING") {
            Some(connect_string) => {
                let column = match pick(args.postgres_column, "POSTGRES_COLUMN") {
                    Some(name) => ReadingColumn::parse(&name)
                        .with_context(|| format!("invalid postgres column {name:?}"))?,
                    None => ReadingColumn::default(),
                };
                Some(RelationalConfig {
                    connect_string,
                    column,
                })
            }
            None => None,
        };

        let broker = pick(args.broker_bootstrap, "BROKER_BOOTSTRAP").map(|bootstrap| BrokerConfig {
            bootstrap,
            topic: pick(args.broker_topic.clone(), "BROKER_TOPIC")
                .unwrap_or_else(|| DEFAULT_BROKER_TOPIC.to_string()),
            sa_key: pick(args.broker_sa_key.clone(), "BROKER_SA_KEY"),
            sa_secret: pick(args.broker_sa_secret.clone(), "BROKER_SA_SECRET"),
            client_id: pick(args.broker_client_id.clone(), "BROKER_CLIENT_ID")
                .unwrap_or_else(|| format!("senstore-{}", uuid::Uuid::new_v4().simple())),
            keep_alive: Duration::from_secs(
                pick_num(args.broker_keepalive_secs, "BROKER_KEEPALIVE_SECS").unwrap_or(45),
            ),
            tls: !(args.broker_insecure
                || env("BROKER_INSECURE")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false)),
        });

        Ok(Self {
            scrape,
            interval,
            relational,
            broker,
            otlp_endpoint: non_empty(env("OTEL_EXPORTER_OTLP_ENDPOINT")),
        })
    }
}
