use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::scheduler::RetryScheduler;
use crate::server::{self, IngestState};
use crate::sink::Sink;
use crate::sink_http::HttpSink;
use crate::sink_kafka::KafkaSink;
use crate::storage::{MessageStore, SqliteStore};

/// Tasks still running past this deadline are abandoned; the process exits
/// regardless.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RETENTION_DAYS: u32 = 7;

/// How the process should exit after [`Bridge::run`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Interrupt or terminate: exit cleanly.
    Graceful,
    /// Hangup: exit with the restart code so an outer supervisor
    /// relaunches the process.
    Restart,
}

/// Owns every long-lived component and their lifecycle.
///
/// Construction order is store, then sinks, then the ingest surface; the
/// scheduler only exists when a store does. Shutdown tears the same set
/// down in reverse.
#[derive(Debug)]
pub struct Bridge {
    config: Arc<Config>,
    store: Option<Arc<SqliteStore>>,
    kafka: Option<Arc<KafkaSink>>,
    http: Option<Arc<HttpSink>>,
}

impl Bridge {
    /// Build all configured components. Any failure here should surface as
    /// a restart to the outer supervisor.
    pub async fn initialize(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = match &config.sqlite {
            Some(sqlite) => {
                let store = SqliteStore::open(&sqlite.database_path).await?;
                info!(path = %sqlite.database_path, "sqlite store initialized");
                Some(Arc::new(store))
            }
            None => None,
        };

        let kafka = match &config.kafka {
            Some(cfg) => {
                let sink = KafkaSink::new(cfg)?;
                info!(brokers = ?cfg.brokers, "kafka sink initialized");
                Some(Arc::new(sink))
            }
            None => None,
        };

        let http = match &config.remote_url {
            Some(cfg) => {
                let sink = HttpSink::new(cfg)?;
                info!(url = %cfg.url, "http sink initialized");
                Some(Arc::new(sink))
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            kafka,
            http,
        })
    }

    /// Run until a shutdown signal arrives, then drain everything under
    /// the shutdown budget and close resources in reverse startup order.
    pub async fn run(self) -> Result<Shutdown> {
        let shutdown = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let store: Option<Arc<dyn MessageStore>> =
            self.store.clone().map(|s| s as Arc<dyn MessageStore>);
        let kafka: Option<Arc<dyn Sink>> = self.kafka.clone().map(|s| s as Arc<dyn Sink>);
        let http: Option<Arc<dyn Sink>> = self.http.clone().map(|s| s as Arc<dyn Sink>);

        let state = Arc::new(IngestState::new(self.config.clone(), store.clone()));
        let app = server::router(state);
        let addr = format!(
            "{}:{}",
            self.config.server.host, self.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| BridgeError::Internal(format!("failed to bind {addr}: {err}")))?;
        info!(addr = %addr, "ingest server listening");
        let token = shutdown.clone();
        tasks.push((
            "server",
            tokio::spawn(async move {
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                if let Err(err) = axum::serve(listener, service)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
                {
                    error!(error = %err, "ingest server error");
                }
            }),
        ));

        if let Some(store) = store.clone() {
            let scheduler = RetryScheduler::new(
                store,
                kafka.clone(),
                http.clone(),
                self.config.worker.clone(),
            );
            let token = shutdown.clone();
            tasks.push((
                "scheduler",
                tokio::spawn(async move { scheduler.run(token).await }),
            ));
        }

        {
            let kafka = kafka.clone();
            let http = http.clone();
            let store = store.clone();
            let token = shutdown.clone();
            tasks.push((
                "health",
                tokio::spawn(async move { health_loop(kafka, http, store, token).await }),
            ));
        }

        if let Some(store) = store.clone() {
            let token = shutdown.clone();
            tasks.push((
                "retention",
                tokio::spawn(async move { retention_loop(store, token).await }),
            ));
        }

        info!("bridge started");

        let outcome = wait_for_signal().await;
        match outcome {
            Shutdown::Graceful => info!("received shutdown signal, shutting down gracefully"),
            Shutdown::Restart => info!("received hangup, shutting down for restart"),
        }

        shutdown.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_BUDGET, async {
            for (name, handle) in tasks {
                match handle.await {
                    Ok(()) => {}
                    Err(err) if err.is_panic() => {
                        error!(task = name, "task panicked during shutdown")
                    }
                    Err(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown budget exceeded, abandoning remaining tasks");
        }

        if let Some(kafka) = &self.kafka {
            kafka.close().await;
            info!("kafka sink closed");
        }
        if let Some(http) = &self.http {
            http.close().await;
        }
        if let Some(store) = &self.store {
            store.close().await;
            info!("store closed");
        }

        info!("shutdown complete");
        Ok(outcome)
    }
}

/// Probe every configured component on a fixed cadence. A probe that
/// panics is contained to its own task; the loop keeps running.
async fn health_loop(
    kafka: Option<Arc<dyn Sink>>,
    http: Option<Arc<dyn Sink>>,
    store: Option<Arc<dyn MessageStore>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let kafka = kafka.clone();
                let http = http.clone();
                let store = store.clone();
                let check =
                    tokio::spawn(async move { health_check(kafka, http, store).await });
                if let Err(err) = check.await {
                    if err.is_panic() {
                        error!("health check panicked");
                    }
                }
            }
        }
    }
}

async fn health_check(
    kafka: Option<Arc<dyn Sink>>,
    http: Option<Arc<dyn Sink>>,
    store: Option<Arc<dyn MessageStore>>,
) {
    let mut components = 0;

    match &kafka {
        Some(sink) => {
            components += 1;
            match sink.health_probe().await {
                Ok(()) => info!(component = sink.kind(), "component healthy"),
                // The broker is the critical dependency: flag it loudly,
                // but leave restarting to the outer supervisor.
                Err(err) => {
                    error!(component = sink.kind(), error = %err, "critical component unhealthy")
                }
            }
        }
        None => info!(component = "kafka", "component not configured"),
    }

    match &http {
        Some(sink) => {
            components += 1;
            match sink.health_probe().await {
                Ok(()) => info!(component = sink.kind(), "component healthy"),
                Err(err) => {
                    warn!(component = sink.kind(), error = %err, "component unhealthy")
                }
            }
        }
        None => info!(component = "remote_url", "component not configured"),
    }

    match &store {
        Some(store) => {
            components += 1;
            match store.stats().await {
                Ok(stats) => info!(component = "storage", ?stats, "component healthy"),
                Err(err) => warn!(component = "storage", error = %err, "component unhealthy"),
            }
        }
        None => info!(component = "storage", "component not configured"),
    }

    info!(components, "health check completed");
}

async fn retention_loop(store: Arc<dyn MessageStore>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match store.sweep(RETENTION_DAYS).await {
                    Ok(removed) => {
                        info!(removed, retention_days = RETENTION_DAYS, "retention sweep completed")
                    }
                    Err(err) => error!(error = %err, "retention sweep failed"),
                }
            }
        }
    }
}

async fn wait_for_signal() -> Shutdown {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = interrupt.recv() => Shutdown::Graceful,
            _ = terminate.recv() => Shutdown::Graceful,
            _ = hangup.recv() => Shutdown::Restart,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        Shutdown::Graceful
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, ServerConfig};

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            routes: vec![RouteConfig {
                path: "/hook/a".into(),
                queue: "q1".into(),
            }],
            kafka: None,
            sqlite: None,
            remote_url: None,
            worker: Default::default(),
        }
    }

    #[tokio::test]
    async fn initialize_skips_unconfigured_components() {
        let bridge = Bridge::initialize(base_config()).await.unwrap();
        assert!(bridge.store.is_none());
        assert!(bridge.kafka.is_none());
        assert!(bridge.http.is_none());
    }

    #[tokio::test]
    async fn initialize_propagates_sink_construction_failure() {
        let mut config = base_config();
        config.kafka = Some(crate::config::KafkaConfig {
            brokers: vec!["localhost:9092".into()],
            security_protocol: String::new(),
            sasl_mechanism: "GSSAPI".into(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            tls_enabled: false,
            retry_max: 3,
            retry_backoff: Duration::from_secs(2),
            batch_size: 100,
            timeout: Duration::from_secs(30),
        });

        let err = Bridge::initialize(config).await.unwrap_err();
        assert!(err.to_string().contains("unsupported SASL mechanism"));
    }
}
