//! Listener Lifecycle Manager
//!
//! Owns one mutually-authenticated gRPC listener from bind to release.
//!
//! # Lifecycle
//!
//! [`GatewayServer::start`] runs the whole life of the listener:
//!
//! 1. `Starting`: load TLS material and build the mTLS credential. Any
//!    failure ends in `Stopped` with [`ServerError::Configuration`] before a
//!    socket is opened.
//! 2. Bind the TCP port ([`ServerError::Bind`] on failure, then `Stopped`).
//! 3. Install the token gate, reflection and the supplied services.
//! 4. `Serving`: the tonic server runs on a spawned task while the calling
//!    task watches the stop token.
//! 5. `Draining`: on stop, tonic's graceful shutdown is triggered and the
//!    serve task is awaited, bounded by the drain timeout if one is set.
//! 6. `Stopped`: the listener has been released.
//!
//! The token gate is not optional: `start` takes the interceptor by value
//! and always layers it over every route.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tower::Service;
use tower::layer::util::{Identity, Stack};

use crate::domain::lifecycle::ServerState;
use crate::infrastructure::grpc::FILE_DESCRIPTOR_SET;
use crate::infrastructure::grpc::interceptor::{TokenGateLayer, TokenInterceptor};
use crate::infrastructure::metrics;
use crate::infrastructure::tls::{MtlsCredential, TlsError, TlsMaterial};

type GatedRouter = Router<Stack<TokenGateLayer, Identity>>;

// =============================================================================
// Errors
// =============================================================================

/// Listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// TLS material missing or malformed. Nothing was bound.
    #[error("TLS configuration error: {0}")]
    Configuration(#[from] TlsError),

    /// Port in use or not permitted.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reflection service could not be built.
    #[error("reflection service error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// The transport failed while serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The serve task panicked or was cancelled.
    #[error("serve task failed: {0}")]
    Task(String),

    /// Graceful drain exceeded the configured deadline; the listener was
    /// force-closed.
    #[error("graceful drain did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

impl ServerError {
    /// True for errors raised before the listener started serving.
    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Bind { .. } | Self::Reflection(_)
        )
    }
}

// =============================================================================
// Settings and Services
// =============================================================================

/// Per-listener settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    /// Address to bind.
    pub bind_ip: IpAddr,
    /// Port to bind (0 = ephemeral).
    pub port: u16,
    /// Upper bound on graceful drain (`None` = wait indefinitely).
    pub drain_timeout: Option<Duration>,
    /// Register the gRPC reflection service.
    pub reflection: bool,
}

impl ListenerSettings {
    /// Settings for `port` on all interfaces, 30s drain, reflection on.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port,
            drain_timeout: Some(Duration::from_secs(30)),
            reflection: true,
        }
    }

    /// Bind a specific address.
    #[must_use]
    pub const fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    /// Set the drain deadline.
    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Option<Duration>) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Enable or disable reflection.
    #[must_use]
    pub const fn with_reflection(mut self, reflection: bool) -> Self {
        self.reflection = reflection;
        self
    }

    /// Socket address to bind.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

/// gRPC services a listener will host.
#[derive(Debug, Default)]
pub struct ServiceSet {
    routes: RoutesBuilder,
    names: Vec<&'static str>,
}

impl ServiceSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a generated tonic service.
    #[must_use]
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.names.push(S::NAME);
        self.routes.add_service(service);
        self
    }

    /// Fully-qualified names of the registered services.
    #[must_use]
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable view of a listener: observe state, request stop.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    name: &'static str,
    state: watch::Receiver<ServerState>,
    stop: CancellationToken,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

impl ServerHandle {
    /// Listener name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Request a graceful stop. Later calls are no-ops.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!(listener = self.name, "Stop requested");
        }
        self.stop.cancel();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound address, once the listener has bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Wait until the listener reaches `target`.
    ///
    /// Returns `false` if the listener finished without reaching it.
    pub async fn wait_for_state(&self, target: ServerState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }

    /// Wait until the listener has stopped.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

// =============================================================================
// Server
// =============================================================================

/// One gRPC listener. Consumed by [`GatewayServer::start`]; a stopped
/// listener is never restarted.
#[derive(Debug)]
pub struct GatewayServer {
    name: &'static str,
    settings: ListenerSettings,
    state: watch::Sender<ServerState>,
    stop: CancellationToken,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

impl GatewayServer {
    /// Create a listener in the `Created` state.
    #[must_use]
    pub fn new(name: &'static str, settings: ListenerSettings) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        metrics::set_listener_state(name, ServerState::Created);
        Self {
            name,
            settings,
            state,
            stop: CancellationToken::new(),
            local_addr: Arc::new(OnceLock::new()),
        }
    }

    /// Use an externally owned stop token (shared across listeners).
    #[must_use]
    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Listener name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Listener settings.
    #[must_use]
    pub const fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// Handle for observing and stopping this listener.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            name: self.name,
            state: self.state.subscribe(),
            stop: self.stop.clone(),
            local_addr: Arc::clone(&self.local_addr),
        }
    }

    /// Run the listener until stopped.
    ///
    /// Returns once the listener has been released.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Configuration`] / [`ServerError::Reflection`] before
    ///   binding.
    /// - [`ServerError::Bind`] when the port cannot be bound.
    /// - [`ServerError::Transport`] / [`ServerError::Task`] if serving fails.
    /// - [`ServerError::ShutdownTimeout`] if draining exceeds the deadline.
    pub async fn start(
        self,
        material: &TlsMaterial,
        interceptor: TokenInterceptor,
        services: ServiceSet,
    ) -> Result<(), ServerError> {
        self.advance(ServerState::Starting);

        let (router, listener) = match self.prepare(material, interceptor, services).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(listener = self.name, error = %e, "Listener failed to start");
                self.advance(ServerState::Stopped);
                return Err(e);
            }
        };

        self.serve(router, listener).await
    }

    /// Credential, routes, then bind. Nothing is bound unless the
    /// credential is valid.
    async fn prepare(
        &self,
        material: &TlsMaterial,
        interceptor: TokenInterceptor,
        services: ServiceSet,
    ) -> Result<(GatedRouter, TcpListener), ServerError> {
        let credential = MtlsCredential::from_material(material)?;
        tracing::debug!(
            listener = self.name,
            trust_anchors = credential.trust_anchors(),
            "mTLS credential ready"
        );

        let ServiceSet { mut routes, names } = services;
        if self.settings.reflection {
            let v1 = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
                .build_v1()?;
            let v1alpha = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
                .build_v1alpha()?;
            routes.add_service(v1).add_service(v1alpha);
        }

        let mut builder = Server::builder()
            .tls_config(credential.into_server_tls_config())
            .map_err(|e| TlsError::Credential(e.to_string()))?
            .layer(interceptor.layer());
        let router = builder.add_routes(routes.routes());

        let addr = self.settings.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        let _ = self.local_addr.set(bound);

        tracing::info!(
            listener = self.name,
            addr = %bound,
            services = ?names,
            reflection = self.settings.reflection,
            "gRPC listener bound"
        );

        Ok((router, listener))
    }

    async fn serve(self, router: GatedRouter, listener: TcpListener) -> Result<(), ServerError> {
        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let mut serve = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async {
                let _ = drain_rx.await;
            },
        ));

        self.advance(ServerState::Serving);

        tokio::select! {
            joined = &mut serve => {
                let outcome = flatten(joined);
                if let Err(e) = &outcome {
                    tracing::error!(listener = self.name, error = %e, "gRPC listener failed");
                }
                self.advance(ServerState::Stopped);
                return outcome;
            }
            () = self.stop.cancelled() => {}
        }

        self.advance(ServerState::Draining);
        let _ = drain_tx.send(());

        let outcome = match self.settings.drain_timeout {
            Some(limit) => {
                if let Ok(joined) = tokio::time::timeout(limit, &mut serve).await {
                    flatten(joined)
                } else {
                    tracing::warn!(
                        listener = self.name,
                        timeout_secs = limit.as_secs_f64(),
                        "Drain deadline exceeded, closing listener"
                    );
                    serve.abort();
                    let _ = serve.await;
                    Err(ServerError::ShutdownTimeout(limit))
                }
            }
            None => flatten(serve.await),
        };

        self.advance(ServerState::Stopped);
        tracing::info!(listener = self.name, "gRPC listener stopped");
        outcome
    }

    fn advance(&self, next: ServerState) {
        let applied = self.state.send_if_modified(|current| match current.transition(next) {
            Ok(state) => {
                *current = state;
                true
            }
            Err(e) => {
                tracing::warn!(listener = self.name, error = %e, "Ignored lifecycle transition");
                false
            }
        });

        if applied {
            metrics::set_listener_state(self.name, next);
            tracing::debug!(listener = self.name, state = %next, "Listener state changed");
        }
    }
}

fn flatten(
    joined: Result<Result<(), tonic::transport::Error>, JoinError>,
) -> Result<(), ServerError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ServerError::Transport(e)),
        Err(e) => Err(ServerError::Task(e.to_string())),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn localhost(port: u16) -> ListenerSettings {
        ListenerSettings::new(port).with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn listener_settings_defaults() {
        let settings = ListenerSettings::new(6440);
        assert_eq!(settings.socket_addr().to_string(), "0.0.0.0:6440");
        assert_eq!(settings.drain_timeout, Some(Duration::from_secs(30)));
        assert!(settings.reflection);
    }

    #[test]
    fn new_server_starts_in_created() {
        let server = GatewayServer::new("peer", localhost(0));
        let handle = server.handle();
        assert_eq!(handle.state(), ServerState::Created);
        assert_eq!(handle.local_addr(), None);
        assert_eq!(handle.name(), "peer");
    }

    #[test]
    fn stop_is_idempotent() {
        let server = GatewayServer::new("peer", localhost(0));
        let handle = server.handle();
        handle.stop();
        handle.stop();
        assert_eq!(handle.state(), ServerState::Created);
    }

    #[tokio::test]
    async fn bad_material_stops_without_binding() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = GatewayServer::new("peer", localhost(port));
        let handle = server.handle();
        let material = TlsMaterial::new(
            "/nonexistent/ca.pem",
            "/nonexistent/s.pem",
            "/nonexistent/k.pem",
        );

        let err = server
            .start(&material, TokenInterceptor::default(), ServiceSet::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Configuration(_)));
        assert!(err.is_startup());
        assert_eq!(handle.state(), ServerState::Stopped);
        assert_eq!(handle.local_addr(), None);
        assert!(!handle.wait_for_state(ServerState::Serving).await);

        // The port was never taken.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn service_set_starts_empty() {
        assert!(ServiceSet::new().names().is_empty());
    }
}
