//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Json, Router, middleware, routing::get};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ephemeral::{self, CodeStore};
use crate::login::Login;
use crate::session::{Identity, Session, session_gate};
use crate::{Error, Result};

const LOGIN_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Authentication gateway server
pub struct Gateway {
    config: Config,
    session: Arc<Session>,
    login: Arc<Login>,
}

impl Gateway {
    /// Build the session component and login controller; fetches every
    /// provider key set once.
    pub async fn new(config: Config) -> Result<Self> {
        let session = Arc::new(Session::from_config(config.session.clone()).await?);
        let codes = CodeStore::from_config(&config.login.store).await?;
        info!(backend = codes.backend().name(), "Login store ready");
        let login = Arc::new(Login::new(&config.login, Arc::clone(&session), codes));

        Ok(Self { config, session, login })
    }

    /// Shared session component.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The HTTP application.
    #[must_use]
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.session), Arc::clone(&self.login))
    }

    /// Serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut handles = self.session.spawn_background(&shutdown_tx);
        handles.push(ephemeral::spawn_reaper(
            Arc::clone(self.login.codes().backend()),
            LOGIN_REAP_INTERVAL,
            shutdown_tx.subscribe(),
        ));

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            providers = self.config.session.oauth2_providers().count(),
            login = %self.config.login.path.base,
            "Listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        drain(handles, self.config.server.shutdown_timeout).await;
        Ok(())
    }
}

/// Login routes plus the gated session info route.
pub fn router(session: Arc<Session>, login: Arc<Login>) -> Router {
    let protected = Router::new()
        .route("/session/info", get(session_info))
        .layer(middleware::from_fn_with_state(session, session_gate));

    Router::new()
        .route("/health", get(health))
        .merge(login.router())
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Claims context of the caller as seen by downstream handlers.
async fn session_info(Extension(identity): Extension<Identity>) -> Json<Value> {
    Json(json!({
        "provider": identity.provider,
        "roles": identity.claims.roles(),
        "scope": identity.claims.scopes().collect::<Vec<_>>(),
        "claims": identity.claims,
    }))
}

async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let wait = async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task failed");
            }
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        warn!(?timeout, "Background tasks did not stop in time");
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
