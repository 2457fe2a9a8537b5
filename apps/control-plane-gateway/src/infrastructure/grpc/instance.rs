//! Gateway Instance
//!
//! Composes the two listeners of the control plane around one service
//! implementation:
//!
//! - **peer** (`grpc_port`): `ControllerService` for enrolled nodes, with
//!   the peer CA.
//! - **bootstrap** (`bootstrap_port`): `BootstrapService` for enrolling
//!   nodes, with the bootstrap CA.
//!
//! Both listeners share one token interceptor and one stop token, so a
//! single stop request drains both. If either fails to start the other is
//! stopped as well.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::interceptor::TokenInterceptor;
use super::proto::controller::v1::bootstrap_service_server::{
    BootstrapService, BootstrapServiceServer,
};
use super::proto::controller::v1::controller_service_server::{
    ControllerService, ControllerServiceServer,
};
use super::server::{GatewayServer, ListenerSettings, ServerError, ServerHandle, ServiceSet};
use crate::domain::lifecycle::ServerState;
use crate::infrastructure::config::{GatewayConfig, ServerEndpoint};
use crate::infrastructure::tls::TlsMaterial;

/// Peer listener name.
pub const PEER_LISTENER: &str = "peer";

/// Bootstrap listener name.
pub const BOOTSTRAP_LISTENER: &str = "bootstrap";

// =============================================================================
// Handle
// =============================================================================

/// Cloneable control surface for a running instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    stop: CancellationToken,
    peer: ServerHandle,
    bootstrap: ServerHandle,
    unregistered: mpsc::Sender<String>,
}

impl InstanceHandle {
    /// Stop both listeners. Idempotent.
    pub fn stop(&self) {
        self.peer.stop();
        self.bootstrap.stop();
        self.stop.cancel();
    }

    /// True once both listeners are serving.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.peer.state() == ServerState::Serving && self.bootstrap.state() == ServerState::Serving
    }

    /// Wait until both listeners serve. `false` if either stopped first.
    pub async fn wait_ready(&self) -> bool {
        let (peer, bootstrap) = tokio::join!(
            self.peer.wait_for_state(ServerState::Serving),
            self.bootstrap.wait_for_state(ServerState::Serving)
        );
        peer && bootstrap
    }

    /// Peer listener handle.
    #[must_use]
    pub const fn peer(&self) -> &ServerHandle {
        &self.peer
    }

    /// Bootstrap listener handle.
    #[must_use]
    pub const fn bootstrap(&self) -> &ServerHandle {
        &self.bootstrap
    }

    /// Publish a node token as unregistered to whoever consumes the
    /// unregistration channel.
    ///
    /// Returns `false` if nobody is listening any more.
    pub async fn notify_unregistered(&self, node_token: impl Into<String>) -> bool {
        self.unregistered.send(node_token.into()).await.is_ok()
    }
}

// =============================================================================
// Instance
// =============================================================================

/// Both gRPC listeners plus everything they share.
#[derive(Debug)]
pub struct GatewayInstance<S> {
    service: Arc<S>,
    stop: CancellationToken,
    peer_tls: TlsMaterial,
    bootstrap_tls: TlsMaterial,
    interceptor: TokenInterceptor,
    unregistered: mpsc::Sender<String>,
    peer: GatewayServer,
    bootstrap: GatewayServer,
}

impl<S> GatewayInstance<S>
where
    S: ControllerService + BootstrapService,
{
    /// Assemble an instance from its parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Arc<S>,
        endpoint: &ServerEndpoint,
        peer: ListenerSettings,
        bootstrap: ListenerSettings,
        peer_tls: TlsMaterial,
        bootstrap_tls: TlsMaterial,
        interceptor: TokenInterceptor,
        unregistered: mpsc::Sender<String>,
    ) -> Self {
        let stop = CancellationToken::new();
        let peer = GatewayServer::new(
            PEER_LISTENER,
            ListenerSettings {
                port: endpoint.grpc_port,
                ..peer
            },
        )
        .with_stop_token(stop.child_token());
        let bootstrap = GatewayServer::new(
            BOOTSTRAP_LISTENER,
            ListenerSettings {
                port: endpoint.bootstrap_port,
                ..bootstrap
            },
        )
        .with_stop_token(stop.child_token());

        Self {
            service,
            stop,
            peer_tls,
            bootstrap_tls,
            interceptor,
            unregistered,
            peer,
            bootstrap,
        }
    }

    /// Assemble an instance from loaded configuration.
    #[must_use]
    pub fn from_config(
        service: Arc<S>,
        config: &GatewayConfig,
        unregistered: mpsc::Sender<String>,
    ) -> Self {
        let listener = ListenerSettings::new(0)
            .with_bind_ip(config.settings.bind_ip)
            .with_drain_timeout(config.settings.drain_timeout)
            .with_reflection(config.settings.reflection_enabled);

        Self::new(
            service,
            &config.endpoint,
            listener,
            listener,
            config.peer_tls.clone(),
            config.bootstrap_tls.clone(),
            TokenInterceptor::new(config.settings.enrollment_policy()),
            unregistered,
        )
    }

    /// Control surface for this instance.
    #[must_use]
    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            stop: self.stop.clone(),
            peer: self.peer.handle(),
            bootstrap: self.bootstrap.handle(),
            unregistered: self.unregistered.clone(),
        }
    }

    /// Serve both listeners until stopped.
    ///
    /// # Errors
    ///
    /// The first listener error, peer before bootstrap. Either listener
    /// failing stops the other.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            service,
            stop,
            peer_tls,
            bootstrap_tls,
            interceptor,
            peer,
            bootstrap,
            ..
        } = self;

        let peer_services =
            ServiceSet::new().add_service(ControllerServiceServer::from_arc(Arc::clone(&service)));
        let bootstrap_services =
            ServiceSet::new().add_service(BootstrapServiceServer::from_arc(service));

        let (peer_result, bootstrap_result) = tokio::join!(
            stop_on_error(
                peer.start(&peer_tls, interceptor.clone(), peer_services),
                &stop
            ),
            stop_on_error(
                bootstrap.start(&bootstrap_tls, interceptor, bootstrap_services),
                &stop
            ),
        );

        peer_result.and(bootstrap_result)
    }
}

async fn stop_on_error(
    listener: impl Future<Output = Result<(), ServerError>>,
    stop: &CancellationToken,
) -> Result<(), ServerError> {
    let result = listener.await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Listener failed, stopping instance");
        stop.cancel();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockTokenValidationPort;
    use crate::infrastructure::grpc::controller::{AdvertisedEndpoint, NodeControlService};

    fn instance(tls: &TlsMaterial) -> GatewayInstance<NodeControlService> {
        let (tx, _rx) = mpsc::channel(1);
        let endpoint = ServerEndpoint {
            grpc_port: 0,
            bootstrap_port: 0,
            network_port: 0,
        };
        let service = NodeControlService::new(
            Arc::new(MockTokenValidationPort::new()),
            AdvertisedEndpoint::new([127, 0, 0, 1].into(), &endpoint),
            tls.clone(),
            tx.clone(),
        );
        let listener = ListenerSettings::new(0).with_bind_ip([127, 0, 0, 1].into());

        GatewayInstance::new(
            Arc::new(service),
            &endpoint,
            listener,
            listener,
            tls.clone(),
            tls.clone(),
            TokenInterceptor::default(),
            tx,
        )
    }

    #[test]
    fn handle_reports_created_listeners() {
        let tls = TlsMaterial::new("/none/ca.pem", "/none/s.pem", "/none/k.pem");
        let handle = instance(&tls).handle();

        assert_eq!(handle.peer().name(), PEER_LISTENER);
        assert_eq!(handle.bootstrap().name(), BOOTSTRAP_LISTENER);
        assert_eq!(handle.peer().state(), ServerState::Created);
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn configuration_failure_stops_both_listeners() {
        let tls = TlsMaterial::new("/none/ca.pem", "/none/s.pem", "/none/k.pem");
        let instance = instance(&tls);
        let handle = instance.handle();

        let err = instance.run().await.unwrap_err();

        assert!(matches!(err, ServerError::Configuration(_)));
        assert_eq!(handle.peer().state(), ServerState::Stopped);
        assert_eq!(handle.bootstrap().state(), ServerState::Stopped);
        assert!(!handle.wait_ready().await);
    }

    #[tokio::test]
    async fn stop_before_run_is_harmless() {
        let tls = TlsMaterial::new("/none/ca.pem", "/none/s.pem", "/none/k.pem");
        let handle = instance(&tls).handle();
        handle.stop();
        handle.stop();
        assert_eq!(handle.peer().state(), ServerState::Created);
    }
}
