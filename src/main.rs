mod batch;
mod config;
mod control;
mod dispatch;
mod mqtt;
mod payload;
mod pipeline;
mod processor;
mod session;
mod telemetry;
mod vitals;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::processor::RelayProcessor;
use crate::session::{build_pool, SessionStore};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,biosensor_relay=info".into());
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
                KeyValue::new("service.name", "biosensor-relay"),
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
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    config.log_summary();

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = SessionStore::new(pool);
    store
        .init_schema()
        .await
        .context("initialise session schema")?;

    let processor = RelayProcessor::new(&config, store)?;
    processor.restore().await?;

    let cancel = CancellationToken::new();

    let mut control_handle = tokio::spawn(mqtt::run_control_listener(
        config.clone(),
        processor.clone(),
        cancel.clone(),
    ));
    let mut telemetry_handle = tokio::spawn(mqtt::run_telemetry_listener(
        config.clone(),
        processor.clone(),
        cancel.clone(),
    ));
    let housekeeping_handle = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        let interval = config.housekeeping_interval();
        tokio::spawn(async move { processor.run_housekeeping(interval, cancel).await })
    };

    let fatal = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            None
        }
        res = &mut control_handle => Some(listener_exit("control", res)),
        res = &mut telemetry_handle => Some(listener_exit("telemetry", res)),
    };
    cancel.cancel();

    for (name, handle) in [("control", control_handle), ("telemetry", telemetry_handle)] {
        if fatal.is_some() && handle.is_finished() {
            continue;
        }
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(listener = name, error = %err, "listener exited"),
            Err(err) => tracing::warn!(listener = name, error = %err, "listener task failed"),
        }
    }
    if let Err(err) = housekeeping_handle.await {
        tracing::warn!(error = %err, "housekeeping task failed");
    }

    processor.settle().await;
    tracing::info!("in-flight deliveries settled; exiting");

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn listener_exit(
    name: &str,
    res: Result<Result<()>, tokio::task::JoinError>,
) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow::anyhow!("{name} listener stopped unexpectedly"),
        Ok(Err(err)) => err.context(format!("{name} listener failed")),
        Err(err) => anyhow::Error::new(err).context(format!("{name} listener task panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
