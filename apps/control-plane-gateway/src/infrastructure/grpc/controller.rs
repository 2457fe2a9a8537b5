//! Node Control Services
//!
//! Reference handlers for the two listeners:
//!
//! - `BootstrapService.GetToken` (enrollment listener): exchanges a
//!   bootstrap token for a node token plus the peer channel's connection
//!   details and client credential bundle.
//! - `ControllerService` (peer listener): health, connection state and
//!   unregistration for enrolled nodes.
//!
//! The token gate guarantees a token is *present*; every handler here
//! validates its *value* through [`TokenValidationPort`] before acting.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use super::proto::controller::v1::{
    CheckConnStateRequest, CheckConnStateResponse, GetTokenRequest, GetTokenResponse,
    HealthCheckRequest, HealthCheckResponse, UnRegisterRequest, UnRegisterResponse,
    bootstrap_service_server::BootstrapService, controller_service_server::ControllerService,
};
use crate::application::ports::{RegistryError, TokenValidationPort};
use crate::domain::auth::{CredentialKind, PresentedCredential};
use crate::infrastructure::config::ServerEndpoint;
use crate::infrastructure::metrics;
use crate::infrastructure::tls::TlsMaterial;

// =============================================================================
// Advertised Endpoint
// =============================================================================

/// Connection details handed to a node on enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisedEndpoint {
    /// Address nodes should dial.
    pub ip: IpAddr,
    /// Enrollment listener port.
    pub bootstrap_port: u16,
    /// Peer listener port.
    pub grpc_port: u16,
    /// Network-service port.
    pub network_port: u16,
}

impl AdvertisedEndpoint {
    /// Advertise `ip` with the ports from `endpoint`.
    #[must_use]
    pub const fn new(ip: IpAddr, endpoint: &ServerEndpoint) -> Self {
        Self {
            ip,
            bootstrap_port: endpoint.bootstrap_port,
            grpc_port: endpoint.grpc_port,
            network_port: endpoint.network_port,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Implements both `BootstrapService` and `ControllerService`.
pub struct NodeControlService {
    registry: Arc<dyn TokenValidationPort>,
    advertised: AdvertisedEndpoint,
    peer_tls: TlsMaterial,
    unregistered: mpsc::Sender<String>,
}

impl std::fmt::Debug for NodeControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeControlService")
            .field("registry", &"...")
            .field("advertised", &self.advertised)
            .field("peer_tls", &self.peer_tls)
            .finish_non_exhaustive()
    }
}

impl NodeControlService {
    /// Create the service.
    ///
    /// `unregistered` receives the node token of every node that
    /// unregisters.
    #[must_use]
    pub fn new(
        registry: Arc<dyn TokenValidationPort>,
        advertised: AdvertisedEndpoint,
        peer_tls: TlsMaterial,
        unregistered: mpsc::Sender<String>,
    ) -> Self {
        Self {
            registry,
            advertised,
            peer_tls,
            unregistered,
        }
    }

    /// Endpoint advertised on enrollment.
    #[must_use]
    pub const fn advertised(&self) -> &AdvertisedEndpoint {
        &self.advertised
    }

    /// PEM bundle a node needs to dial the peer listener: CA, client
    /// certificate, client key. Empty strings when not configured.
    async fn client_bundle(&self) -> Result<(String, String, String), Status> {
        let ca = read_pem(Some(self.peer_tls.ca_cert())).await?;
        let cert = read_pem(self.peer_tls.client_cert()).await?;
        let key = read_pem(self.peer_tls.client_key()).await?;
        Ok((ca, cert, key))
    }
}

async fn read_pem(path: Option<&std::path::Path>) -> Result<String, Status> {
    let Some(path) = path else {
        return Ok(String::new());
    };
    tokio::fs::read_to_string(path).await.map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Failed to read credential bundle");
        Status::internal("credential bundle unavailable")
    })
}

/// Token admitted by the gate for this call.
fn presented<T>(request: &Request<T>, kind: CredentialKind) -> Result<&str, Status> {
    request
        .extensions()
        .get::<PresentedCredential>()
        .filter(|c| c.kind() == kind)
        .map(PresentedCredential::value)
        .ok_or_else(|| Status::unauthenticated(format!("missing {kind}")))
}

fn rejected(error: &RegistryError) -> Status {
    match error {
        RegistryError::UnknownBootstrapToken => Status::unauthenticated("invalid bootstrap-token"),
        RegistryError::UnknownNodeToken => Status::unauthenticated("invalid node-token"),
    }
}

#[tonic::async_trait]
impl BootstrapService for NodeControlService {
    async fn get_token(
        &self,
        request: Request<GetTokenRequest>,
    ) -> Result<Response<GetTokenResponse>, Status> {
        let bootstrap_token = presented(&request, CredentialKind::Bootstrap)?;
        let node_name = request.get_ref().node_name.as_str();
        let node_token = self
            .registry
            .enroll(bootstrap_token, node_name)
            .map_err(|e| {
                tracing::warn!(error = %e, "Enrollment refused");
                rejected(&e)
            })?;

        // Revoke the token if its bundle cannot be delivered.
        let (ca_cert, client_cert, client_key) = match self.client_bundle().await {
            Ok(bundle) => bundle,
            Err(status) => {
                let _ = self.registry.revoke(&node_token);
                return Err(status);
            }
        };
        metrics::record_enrollment();
        tracing::info!(node_name = %node_name, "Issued node token");

        Ok(Response::new(GetTokenResponse {
            node_token,
            server_ip: self.advertised.ip.to_string(),
            bootstrap_port: u32::from(self.advertised.bootstrap_port),
            grpc_port: u32::from(self.advertised.grpc_port),
            network_port: u32::from(self.advertised.network_port),
            ca_cert,
            client_cert,
            client_key,
        }))
    }
}

#[tonic::async_trait]
impl ControllerService for NodeControlService {
    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let token = presented(&request, CredentialKind::Node)?;
        self.registry.verify_node(token).map_err(|e| rejected(&e))?;

        Ok(Response::new(HealthCheckResponse {
            status: "ok".to_string(),
        }))
    }

    async fn check_conn_state(
        &self,
        request: Request<CheckConnStateRequest>,
    ) -> Result<Response<CheckConnStateResponse>, Status> {
        let token = presented(&request, CredentialKind::Node)?;
        let record = self.registry.verify_node(token).map_err(|e| rejected(&e))?;

        Ok(Response::new(CheckConnStateResponse {
            registered: true,
            enrolled_at: record.enrolled_at.to_rfc3339(),
            last_seen: record.last_seen.to_rfc3339(),
        }))
    }

    async fn un_register(
        &self,
        request: Request<UnRegisterRequest>,
    ) -> Result<Response<UnRegisterResponse>, Status> {
        let token = presented(&request, CredentialKind::Node)?.to_string();
        self.registry.revoke(&token).map_err(|e| rejected(&e))?;

        if self.unregistered.send(token).await.is_err() {
            tracing::warn!("Unregistration listener has gone away");
        }
        metrics::record_unregistration();
        tracing::info!("Node unregistered");

        Ok(Response::new(UnRegisterResponse { result: true }))
    }
}

// =============================================================================
// Tests
// =============================================================================
