use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use plume_model::Ticket;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::{RegistryConfig, TicketRegistry};
use crate::{error::LockError, pid::ProcessTable};

/// Ticket registries of every lock name, created on first use.
pub struct RegistryService {
    cfg: RegistryConfig,
    processes: Arc<dyn ProcessTable>,
    registries: Mutex<HashMap<String, Arc<TicketRegistry>>>,
}

impl RegistryService {
    pub fn new(cfg: RegistryConfig, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            cfg,
            processes,
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self, lock_name: &str) -> Arc<TicketRegistry> {
        let mut registries = self.registries.lock().unwrap();
        let registry = registries.entry(lock_name.to_string()).or_insert_with(|| {
            Arc::new(TicketRegistry::new(
                lock_name,
                self.cfg.clone(),
                Arc::clone(&self.processes),
            ))
        });
        Arc::clone(registry)
    }

    /// Routes:
    /// - POST /v1/locks/{name}/tickets - register or refresh a ticket, list the queue
    /// - GET /v1/locks/{name}/tickets - list the queue
    /// - POST /v1/locks/{name}/end - drop a ticket
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v1/locks/{name}/tickets", post(get_tickets).get(list_tickets))
            .route("/v1/locks/{name}/end", post(end_work))
            .with_state(self)
    }
}

/// POST /v1/locks/{name}/tickets
async fn get_tickets(
    State(service): State<Arc<RegistryService>>,
    Path(name): Path<String>,
    Json(ticket): Json<Ticket>,
) -> Result<Json<Vec<Ticket>>, StatusCode> {
    let registry = service.registry(&name);
    // Pid eviction scans the process table.
    tokio::task::spawn_blocking(move || registry.get_tickets(ticket))
        .await
        .map(Json)
        .map_err(|e| {
            warn!(lock = %name, error = %e, "ticket poll aborted");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// GET /v1/locks/{name}/tickets
async fn list_tickets(
    State(service): State<Arc<RegistryService>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(service.registry(&name).snapshot())
}

/// POST /v1/locks/{name}/end
async fn end_work(
    State(service): State<Arc<RegistryService>>,
    Path(name): Path<String>,
    Json(ticket): Json<Ticket>,
) -> impl IntoResponse {
    service.registry(&name).end_work(&ticket);
    StatusCode::NO_CONTENT
}

/// A running registry endpoint. Dropping it shuts the endpoint down.
pub struct RegistryServer {
    addr: SocketAddr,
    service: Arc<RegistryService>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RegistryServer {
    pub async fn bind(
        addr: SocketAddr,
        cfg: RegistryConfig,
        processes: Arc<dyn ProcessTable>,
    ) -> Result<Self, LockError> {
        let bind_err = |source| LockError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let service = Arc::new(RegistryService::new(cfg, processes));
        let cancel = CancellationToken::new();
        let router = Arc::clone(&service).router();

        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "ticket registry server failed");
            }
        });

        info!(%addr, "ticket registry listening");
        Ok(Self {
            addr,
            service,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn service(&self) -> &Arc<RegistryService> {
        &self.service
    }

    /// Stop accepting requests and wait for in-flight ones.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(addr = %self.addr, "ticket registry stopped");
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
