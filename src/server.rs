//! HTTP server for the echo endpoint.
//!
//! Routes:
//! - `/echo`: WebSocket upgrade, then one echo loop per connection
//! - `/`: the static page that bootstraps a browser client
//!
//! Each session runs on its own task. Cancelling the shutdown token stops
//! the listener and asks every open session to close.

use crate::config::Config;
use crate::echo::{self, SessionEnd};
use crate::upgrade::{self, UpgradeConfig, UpgradeError};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// State shared by all requests
#[derive(Clone)]
struct AppState {
    upgrade: Arc<UpgradeConfig>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

/// Server instance
pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let state = AppState {
            upgrade: Arc::new(config.upgrade_config()),
            sessions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };

        Server { config, state }
    }

    /// Token that stops the server and its sessions when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Number of echo sessions currently open
    pub fn active_sessions(&self) -> usize {
        self.state.sessions.len()
    }

    /// Build the request router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/echo", any(echo_handler))
            .route_service("/", ServeFile::new(&self.config.page))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured listen address. Must be called inside a runtime.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        TcpListener::from_std(create_listener(addr)?)
    }

    /// Serve requests on `listener` until the shutdown token is cancelled,
    /// then wait for open sessions to finish.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!(address = %listener.local_addr()?, "Server listening");

        let shutdown = self.state.shutdown.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        let sessions = &self.state.sessions;
        sessions.close();
        if tokio::time::timeout(self.config.shutdown_timeout, sessions.wait())
            .await
            .is_err()
        {
            warn!(sessions = sessions.len(), "Sessions still open after shutdown timeout");
        }

        info!("Server stopped");
        Ok(())
    }

    /// Bind and serve
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind()?;
        self.serve(listener).await?;
        Ok(())
    }
}

/// Upgrade the request and run the echo loop on the resulting connection.
async fn echo_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade::upgrade(&state.upgrade, &headers, ws) {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket upgrade failed");
            return e.into_response();
        }
    };

    // Held for the whole session so shutdown can wait on it
    let guard = state.sessions.token();
    let shutdown = state.shutdown.clone();

    ws.on_failed_upgrade(move |e| {
        warn!(peer = %peer, error = %e, "{}", UpgradeError::NoConnection);
    })
    .on_upgrade(move |mut socket| async move {
        let _guard = guard;
        debug!(peer = %peer, "Session opened");

        let session = echo::run(&mut socket, peer, &shutdown).await;

        match session.end {
            SessionEnd::PeerClosed => {
                debug!(peer = %peer, echoed = session.echoed, "Peer closed session");
            }
            SessionEnd::Failed(e) => {
                debug!(peer = %peer, echoed = session.echoed, error = %e, "Session ended");
            }
            SessionEnd::Shutdown => {
                debug!(peer = %peer, echoed = session.echoed, "Session closed for shutdown");
            }
        }
    })
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
