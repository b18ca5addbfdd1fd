use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use aw_domain::config::{Config, ConfigSeverity, ObservabilityConfig};
use aw_engine::{EchoEngine, EngineRegistry};
use aw_gateway::api;
use aw_gateway::cli::{Cli, Command, ConfigCommand};
use aw_gateway::runtime::store::MemoryStore;
use aw_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            let (config, _config_path) = aw_gateway::cli::load_config()?;
            init_tracing(&config.observability);
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = aw_gateway::cli::load_config()?;
            if !aw_gateway::cli::doctor(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = aw_gateway::cli::load_config()?;
            if !aw_gateway::cli::validate_config(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = aw_gateway::cli::load_config()?;
            aw_gateway::cli::show_config(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentwayd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing, only turned on for the `serve` command — the
/// other subcommands are short-lived CLI invocations that want plain
/// stdout instead. When `observability.otlp_endpoint` is set, every span
/// is additionally forwarded to an OTLP/gRPC collector; left unset, the
/// gateway behaves exactly as before (JSON on stdout, nothing else).
fn init_tracing(observability: &ObservabilityConfig) {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aw_gateway=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    match &observability.otlp_endpoint {
        Some(endpoint) => {
            let sampler = Sampler::TraceIdRatioBased(observability.sample_rate.clamp(0.0, 1.0));
            let exporter = match opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint).build() {
                Ok(exporter) => exporter,
                Err(e) => {
                    // No subscriber is installed yet, so this can't go through `tracing`.
                    eprintln!("otel: failed to build OTLP exporter for {endpoint}: {e}; falling back to JSON-only logging");
                    tracing_subscriber::registry().with(env_filter()).with(fmt_layer).init();
                    return;
                }
            };
            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::builder().with_attribute(KeyValue::new("service.name", observability.service_name.clone())).build())
                .build();
            let tracer = provider.tracer("aw-gateway");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            tracing_subscriber::registry().with(env_filter()).with(fmt_layer).with(otel_layer).init();
        }
        None => {
            tracing_subscriber::registry().with(env_filter()).with(fmt_layer).init();
        }
    }
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("agentway gateway starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if Config::has_errors(&issues) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    // ── Engine registry ───────────────────────────────────────────────
    // Concrete subprocess engines (claude, codex, ...) are wired in by
    // whoever embeds this crate; the echo engine ships here as the
    // always-available default so a fresh gateway has somewhere to route.
    let mut registry = EngineRegistry::new(config.engines.default_engine.clone());
    registry.register(Arc::new(EchoEngine::new(config.engines.default_engine.clone())));
    let engines = Arc::new(registry);
    tracing::info!(engines = ?engines.list_ids(), default = %engines.default_engine_id(), "engine registry ready");

    // ── Store ─────────────────────────────────────────────────────────
    let store = MemoryStore::new();
    tracing::info!("in-memory store ready");

    // ── App state ─────────────────────────────────────────────────────
    let state = AppState::new(config.clone(), engines, store);
    tracing::info!("scheduler + router + output tracker ready");

    // ── Periodic admission-counter roll (forces the day-boundary reset
    // and stale-waiter GC to run even on an otherwise idle gateway) ────
    {
        let scheduler = state.scheduler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                scheduler.prune_idle_workers();
                let counts = scheduler.counts();
                tracing::debug!(active = counts.active, queued = counts.queued, completed_today = counts.completed_today, "admission sweep");
            }
        });
    }

    // ── CORS ──────────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors_origins);

    let app = api::router()
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(config.server.max_concurrent_requests))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agentway gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// Build a permissive-by-default [`CorsLayer`] from configured origins. A
/// literal `"*"` (or an empty list) allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let exact: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
