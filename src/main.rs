mod broker;
mod config;
mod error;
mod exposition;
mod lifecycle;
mod mqtt;
mod pipeline;
mod readings;
mod scrape;
mod store;

use crate::broker::BrokerWriter;
use crate::config::Config;
use crate::error::TickError;
use crate::pipeline::{DaemonPipeline, RunOutcome};
use crate::scrape::Scraper;
use crate::store::RelationalWriter;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,senstore=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "senstore"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn run(config: Config, cancel: CancellationToken) -> Result<RunOutcome, TickError> {
    let scraper = Scraper::new(&config.scrape)?;
    tracing::info!(endpoint = %scraper.endpoint(), interval = ?config.interval, "scraping");

    let relational = config.relational.as_ref().map(|relational| {
        let writer = RelationalWriter::from_config(relational);
        tracing::info!(column = %writer.column(), "using postgres writer");
        writer
    });

    let broker = config.broker.clone().map(|broker| {
        tracing::info!(
            topic = %broker.topic,
            bootstrap = %broker.bootstrap,
            sa_key = broker.sa_key.as_deref().unwrap_or(""),
            tls = broker.tls,
            "using broker writer"
        );
        BrokerWriter::from_config(broker)
    });

    if relational.is_none() && broker.is_none() {
        tracing::warn!("no sink configured; readings are scraped and discarded");
    }

    let mut pipeline = DaemonPipeline::new(scraper, relational, broker, config.interval);
    spawn_reload_listener(pipeline.reload_flag());
    pipeline.run(cancel).await
}

#[cfg(unix)]
fn spawn_reload_listener(reload: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            tracing::warn!(error=%err, "failed to install SIGHUP handler; registry reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received; registry reloads on next tick");
            reload.store(true, Ordering::Relaxed);
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_reload: Arc<AtomicBool>) {}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    match run(config, cancel).await {
        Ok(RunOutcome::Cancelled) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "failed to execute command");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn appends_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
    }
}
