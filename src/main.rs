//! `llmproxy` — reverse proxy for LLM chat-completion backends.
//!
//! Thin entry point: load config, init logging, construct the provider
//! manager, routing engine, evidence pipeline, and TLS edge, then serve.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use llmproxy::config::{self, Config};
use llmproxy::evidence::storage::memory::InMemoryStorage;
use llmproxy::evidence::storage::sqlite::{SqliteConfig, SqliteStorage};
use llmproxy::evidence::storage::EvidenceStorage;
use llmproxy::evidence::{EvidenceRecorder, EvidenceSigner, RecorderConfig, RetentionConfig, RetentionPruner};
use llmproxy::handlers::{self, AppState};
use llmproxy::pipeline::Pipeline;
use llmproxy::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use llmproxy::providers::generic::{GenericConfig, GenericProvider};
use llmproxy::providers::http_core::HttpCoreConfig;
use llmproxy::providers::manager::ProviderManager;
use llmproxy::providers::openai::{OpenAiConfig, OpenAiProvider};
use llmproxy::providers::LlmProvider;
use llmproxy::routing::policy::{AllowAllPolicy, FailSafeMode, PolicyEngine};
use llmproxy::routing::sticky::{KeyType, StickyCache};
use llmproxy::routing::strategy::{HealthFilterStrategy, ManualStrategy, RoundRobinStrategy, RoutingStrategy};
use llmproxy::routing::{ModelCapabilityMap, RoutingEngine};
use llmproxy::tls;

/// Command-line entry point for the proxy binary.
#[derive(Debug, Parser)]
#[command(name = "llmproxy", about = "Policy-gated reverse proxy for LLM backends")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let _logging_guard = llmproxy::logging::init_production(&config.telemetry)
        .context("failed to initialize logging")?;

    info!(listen_address = %config.proxy.listen_address, "llmproxy starting");

    let manager = Arc::new(build_provider_manager(&config).await?);
    let recorder = build_recorder(&config).await?;
    let routing = Arc::new(build_routing_engine(&config, manager.clone())?);
    let policy: Arc<dyn PolicyEngine> = Arc::new(AllowAllPolicy);
    let fail_safe = match config.policy.mode.as_str() {
        "fail_closed" => FailSafeMode::FailClosed,
        _ => FailSafeMode::FailOpen,
    };

    let pipeline = Arc::new(Pipeline::new(
        manager.clone(),
        routing.clone(),
        policy,
        fail_safe,
        recorder.as_ref().map(|(r, _)| r.clone()),
    ));

    if let Some((_, pruner)) = &recorder {
        spawn_retention_task(pruner.clone());
    }

    let state = AppState {
        pipeline,
        manager: manager.clone(),
        routing,
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.proxy.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.proxy.listen_address))?;

    let shutdown_timeout = Duration::from_secs(config.proxy.shutdown_timeout);

    match config.security.tls.as_ref().filter(|t| t.enabled) {
        Some(tls_config) => {
            let reloader = tls::reload::CertReloader::new(
                PathBuf::from(&tls_config.cert_path),
                PathBuf::from(&tls_config.key_path),
            )
            .context("failed to load initial TLS certificate")?;
            let resolver = Arc::new(tls::server::HotReloadResolver::new(reloader.handle()));
            reloader.spawn_poller(Duration::from_secs(tls_config.poll_interval_secs));

            let server_config = tls::server::build_server_config(tls_config, resolver)
                .context("failed to build TLS server config")?;
            let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

            info!(cert = %tls_config.cert_path, mtls = tls_config.mtls_enabled, "TLS edge enabled");
            tls::server::serve_tls(listener, acceptor, app, tls_config.identity_field, shutdown_signal())
                .await
                .context("tls server error")?;
        }
        None => {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server error")?;
        }
    }

    manager.close_all().await;
    if let Some((recorder, _)) = recorder {
        llmproxy::pipeline::shutdown_recorder(Some(recorder), shutdown_timeout).await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn build_provider_manager(config: &Config) -> Result<ProviderManager> {
    let manager = ProviderManager::new();

    for (name, provider_config) in &config.providers {
        let http = HttpCoreConfig {
            request_timeout: Duration::from_secs(provider_config.timeout),
            max_retries: provider_config.max_retries,
            ..HttpCoreConfig::default()
        };

        let provider: Arc<dyn LlmProvider> = match provider_config.kind.as_str() {
            "openai" => Arc::new(OpenAiProvider::new(OpenAiConfig {
                name: name.clone(),
                base_url: provider_config.base_url.clone(),
                api_key: provider_config.api_key.clone().unwrap_or_default(),
                http,
            })?),
            "anthropic" => Arc::new(AnthropicProvider::new(AnthropicConfig {
                name: name.clone(),
                base_url: provider_config.base_url.clone(),
                api_key: provider_config.api_key.clone().unwrap_or_default(),
                http,
            })?),
            "generic" => Arc::new(GenericProvider::new(GenericConfig {
                name: name.clone(),
                base_url: provider_config.base_url.clone(),
                api_key: provider_config.api_key.clone(),
            })?),
            other => anyhow::bail!("unknown provider kind '{other}' for provider '{name}'"),
        };

        manager.add(name, provider).await;
    }

    Ok(manager)
}

fn build_routing_engine(config: &Config, manager: Arc<ProviderManager>) -> Result<RoutingEngine> {
    let weights: HashMap<String, i32> = config
        .providers
        .iter()
        .map(|(name, p)| (name.clone(), p.weight))
        .collect();

    let base: Box<dyn RoutingStrategy> = match config.routing.strategy.as_str() {
        "manual" => Box::new(ManualStrategy::new(None, Some(Box::new(RoundRobinStrategy::new(weights))), true)),
        _ => Box::new(RoundRobinStrategy::new(weights)),
    };

    let strategy: Box<dyn RoutingStrategy> = Box::new(HealthFilterStrategy::new(
        base,
        manager.clone(),
        config.routing.require_healthy,
    ));

    let sticky = config.routing.sticky.as_ref().map(|s| {
        let key_type = match s.key_type.as_str() {
            "user" => KeyType::User,
            "api_key" => KeyType::ApiKey,
            "session" => KeyType::Session,
            _ => KeyType::Composite,
        };
        Arc::new(StickyCache::new(s.capacity, s.ttl_secs.map(Duration::from_secs), key_type))
    });

    let capabilities = ModelCapabilityMap::new(config.routing.model_capabilities.clone());

    Ok(RoutingEngine::new(
        manager,
        capabilities,
        strategy,
        sticky,
        config.routing.default_provider.clone(),
    ))
}

async fn build_recorder(config: &Config) -> Result<Option<(Arc<EvidenceRecorder>, Arc<RetentionPruner>)>> {
    if !config.evidence.enabled {
        return Ok(None);
    }

    let storage: Arc<dyn EvidenceStorage> = match config.evidence.backend.as_str() {
        "memory" => Arc::new(InMemoryStorage::new()),
        _ => {
            let sqlite_config = SqliteConfig {
                path: config.evidence.sqlite.path.clone(),
                max_open_conns: config.evidence.sqlite.max_open_conns,
                max_idle_conns: config.evidence.sqlite.max_idle_conns,
                wal_mode: config.evidence.sqlite.wal_mode,
                busy_timeout: Duration::from_millis(config.evidence.sqlite.busy_timeout_ms),
            };
            Arc::new(SqliteStorage::open(&sqlite_config).await.context("failed to open evidence database")?)
        }
    };

    let signer = Arc::new(EvidenceSigner::new("default", &signing_seed()));

    let recorder_config = RecorderConfig {
        buffer_size: config.evidence.recorder.buffer_size,
        write_timeout: Duration::from_millis(config.evidence.recorder.write_timeout_ms),
        hash_request: config.evidence.recorder.hash_request,
        hash_response: config.evidence.recorder.hash_response,
        redact_api_keys: config.evidence.recorder.redact_api_keys,
        max_field_length: config.evidence.recorder.max_field_length,
    };

    let recorder = Arc::new(EvidenceRecorder::start(recorder_config, storage.clone(), signer));

    let retention_config = RetentionConfig {
        days: config.evidence.retention.days,
        prune_schedule: config.evidence.retention.prune_schedule.clone(),
        archive_before_delete: config.evidence.retention.archive_before_delete,
        archive_path: config.evidence.retention.archive_path.clone(),
        max_records: config.evidence.retention.max_records,
    };
    let pruner = Arc::new(RetentionPruner::new(retention_config, storage));

    Ok(Some((recorder, pruner)))
}

fn signing_seed() -> [u8; 32] {
    let raw = std::env::var("LLMPROXY_SIGNING_SEED").unwrap_or_default();
    let mut seed = [0u8; 32];
    let bytes = raw.as_bytes();
    let len = bytes.len().min(32);
    seed[..len].copy_from_slice(&bytes[..len]);
    seed
}

fn spawn_retention_task(pruner: Arc<RetentionPruner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();
            if pruner.is_due(now) {
                if let Err(e) = pruner.run_once(now).await {
                    tracing::error!(error = %e, "retention pruning pass failed");
                }
            }
        }
    });
}
