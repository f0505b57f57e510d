//! HTTP server setup and wiring.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::http::auth::management_auth_middleware;
use crate::http::handlers;
use crate::idle::IdleMonitor;
use crate::lifecycle::Shutdown;
use crate::proxy::ReverseProxy;
use crate::registry::ServiceRegistry;
use crate::remote::{HttpExecutor, RemoteExecutor};
use crate::routing::StrategyRegistry;
use crate::startup::StartupOrchestrator;
use crate::store::MetadataStore;

/// Grace period for in-flight requests once shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub registry: Arc<ServiceRegistry>,
    pub strategies: Arc<StrategyRegistry>,
    pub orchestrator: Arc<StartupOrchestrator>,
    pub proxy: Arc<ReverseProxy>,
    pub store: Option<Arc<MetadataStore>>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub probe_client: reqwest::Client,
    pub shutting_down: Arc<AtomicBool>,
}

/// HTTP server for the gateway.
pub struct GatewayServer {
    state: AppState,
    shutdown: Shutdown,
}

impl GatewayServer {
    /// Wire the subsystems together from a validated configuration.
    pub fn new(
        config: GatewayConfig,
        store: Option<Arc<MetadataStore>>,
        metrics_handle: Option<PrometheusHandle>,
        shutdown: Shutdown,
    ) -> Self {
        let registry = Arc::new(ServiceRegistry::new(&config));
        let strategies = Arc::new(StrategyRegistry::new());

        let executor: Option<Arc<dyn RemoteExecutor>> = if config.executor.base_url.is_some() {
            match HttpExecutor::new(&config.executor) {
                Ok(executor) => Some(Arc::new(executor)),
                Err(e) => {
                    tracing::warn!(error = %e, "Remote executor disabled");
                    None
                }
            }
        } else {
            None
        };

        let orchestrator = Arc::new(StartupOrchestrator::new(
            executor,
            store.clone(),
            shutdown.clone(),
        ));
        let proxy = Arc::new(ReverseProxy::new(strategies.clone()));

        if let Some(store) = &store {
            for entry in registry.list() {
                if let Err(e) = store.register_service(&entry.id) {
                    tracing::warn!(service = %entry.id, error = %e, "Failed to register service");
                }
            }
        }

        let state = AppState {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry,
            strategies,
            orchestrator,
            proxy,
            store,
            metrics_handle,
            probe_client: reqwest::Client::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        };

        Self { state, shutdown }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the full router: the transparent proxy surface plus the
    /// `/v1` management surface behind optional bearer auth.
    pub fn router(&self) -> Router {
        let management = Router::new()
            .route("/v1/requests", post(handlers::dispatch_request))
            .route("/v1/services/{id}/status", get(handlers::service_status))
            .route("/v1/services/{id}/start", post(handlers::start_service))
            .route("/v1/services/{id}/stop", post(handlers::stop_service))
            .route("/v1/metrics", get(handlers::render_metrics))
            .route("/v1/strategies", get(handlers::list_strategies))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                management_auth_middleware,
            ));

        Router::new()
            .route("/services/{id}", any(handlers::proxy_service_root))
            .route("/services/{id}/{*rest}", any(handlers::proxy_service_path))
            .merge(management)
            .fallback(handlers::unimplemented_route)
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .with_state(self.state.clone())
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Gateway listening");

        // Reloader task: swap config and reconcile the registry.
        let reloader_state = self.state.clone();
        let mut reloader_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(new_config) = config_updates.recv() => {
                        tracing::info!("Applying new configuration...");
                        reloader_state.registry.apply_config(&new_config);
                        reloader_state.config.store(Arc::new(new_config));
                        tracing::info!("Configuration reload complete");
                    }
                    _ = reloader_shutdown.recv() => {
                        tracing::info!("Config reloader received shutdown signal, exiting loop");
                        break;
                    }
                    else => break,
                }
            }
        });

        // Idle monitor.
        let sweep_interval =
            Duration::from_millis(self.state.config.load().idle.sweep_interval_ms);
        let monitor = IdleMonitor::new(
            self.state.registry.clone(),
            self.state.orchestrator.clone(),
            sweep_interval,
        );
        tokio::spawn(monitor.run(self.shutdown.subscribe()));

        // Drain task: on shutdown, stop admitting and release every parked
        // request before connections close.
        let drain_state = self.state.clone();
        let mut drain_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _ = drain_shutdown.recv().await;
            drain_state.shutting_down.store(true, Ordering::Relaxed);
            drain_state.registry.shutdown_all();
        });

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut graceful_shutdown = self.shutdown.subscribe();
        let mut forced_shutdown = self.shutdown.subscribe();

        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = graceful_shutdown.recv().await;
            tracing::info!("HTTP server initiating graceful shutdown");
        });

        tokio::select! {
            result = async { serve.await } => result?,
            _ = async {
                let _ = forced_shutdown.recv().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::warn!(grace_s = SHUTDOWN_GRACE.as_secs(), "Grace period expired, aborting in-flight requests");
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
