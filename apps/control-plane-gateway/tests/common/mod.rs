//! Shared fixtures: throwaway PKI on disk and mTLS client channels.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use control_plane_gateway::proto::controller_service_server::{
    ControllerService, ControllerServiceServer,
};
use control_plane_gateway::proto::{
    CheckConnStateRequest, CheckConnStateResponse, HealthCheckRequest, HealthCheckResponse,
    UnRegisterRequest, UnRegisterResponse,
};
use control_plane_gateway::{
    GatewayServer, ListenerSettings, ServerError, ServerHandle, ServerState, ServiceSet,
    TlsMaterial, TokenInterceptor,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tonic::transport::{Certificate as TonicCertificate, Channel, ClientTlsConfig, Identity};
use tonic::{Request, Response, Status};

/// Install the ring provider once per test binary.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Loopback listener with ephemeral port and a short drain deadline.
pub fn loopback(port: u16) -> ListenerSettings {
    ListenerSettings::new(port)
        .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_drain_timeout(Some(std::time::Duration::from_secs(5)))
        .with_reflection(true)
}

// =============================================================================
// PKI
// =============================================================================

/// A certificate authority able to issue leaf certificates.
pub struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf; returns `(cert_pem, key_pem)`.
    pub fn issue(&self, sans: &[&str], usage: ExtendedKeyUsagePurpose) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let sans: Vec<String> = sans.iter().map(|s| (*s).to_string()).collect();
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(DnType::CommonName, "leaf");
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    pub fn issue_server(&self) -> (String, String) {
        self.issue(&["localhost", "127.0.0.1"], ExtendedKeyUsagePurpose::ServerAuth)
    }

    pub fn issue_client(&self) -> (String, String) {
        self.issue(&["node.local"], ExtendedKeyUsagePurpose::ClientAuth)
    }
}

/// One channel's PKI written to a temporary directory.
///
/// Layout: `ca.pem`, `server.pem`, `server-key.pem`,
/// `client/client.pem`, `client/client-key.pem`.
pub struct ChannelPki {
    pub dir: TempDir,
    pub authority: Authority,
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

impl ChannelPki {
    pub fn generate(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let authority = Authority::new(name);
        let ca_pem = authority.pem();
        let (server_cert, server_key) = authority.issue_server();
        let (client_cert_pem, client_key_pem) = authority.issue_client();

        std::fs::write(dir.path().join("ca.pem"), &ca_pem).unwrap();
        std::fs::write(dir.path().join("server.pem"), server_cert).unwrap();
        std::fs::write(dir.path().join("server-key.pem"), server_key).unwrap();
        std::fs::create_dir(dir.path().join("client")).unwrap();
        std::fs::write(dir.path().join("client/client.pem"), &client_cert_pem).unwrap();
        std::fs::write(dir.path().join("client/client-key.pem"), &client_key_pem).unwrap();

        Self {
            dir,
            authority,
            ca_pem,
            client_cert_pem,
            client_key_pem,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Server material, with the client bundle directory recorded.
    pub fn material(&self) -> TlsMaterial {
        TlsMaterial::new(
            self.path("ca.pem"),
            self.path("server.pem"),
            self.path("server-key.pem"),
        )
        .with_client_cert_dir(self.path("client"))
    }

    /// Client config presenting this channel's client certificate.
    pub fn client_tls(&self) -> ClientTlsConfig {
        client_tls(&self.ca_pem, Some((&self.client_cert_pem, &self.client_key_pem)))
    }
}

/// Client TLS trusting `ca_pem`, optionally presenting an identity.
pub fn client_tls(ca_pem: &str, identity: Option<(&str, &str)>) -> ClientTlsConfig {
    let config = ClientTlsConfig::new()
        .ca_certificate(TonicCertificate::from_pem(ca_pem))
        .domain_name("localhost");
    match identity {
        Some((cert, key)) => config.identity(Identity::from_pem(cert, key)),
        None => config,
    }
}

/// Dial `addr` over TLS.
pub async fn connect(
    addr: SocketAddr,
    tls: ClientTlsConfig,
) -> Result<Channel, tonic::transport::Error> {
    Channel::from_shared(format!("https://127.0.0.1:{}", addr.port()))
        .unwrap()
        .tls_config(tls)?
        .connect()
        .await
}

/// Attach a metadata entry to a request.
pub fn with_token<T>(message: T, key: &'static str, value: &str) -> Request<T> {
    let mut request = Request::new(message);
    request.metadata_mut().insert(key, value.parse().unwrap());
    request
}

// =============================================================================
// Stub Controller
// =============================================================================

/// `ControllerService` that counts calls and performs no token checks.
///
/// With `stall` set, `HealthCheck` signals `entered` and never returns.
#[derive(Default)]
pub struct CountingController {
    pub calls: AtomicUsize,
    pub stall: bool,
    pub entered: Notify,
}

impl CountingController {
    pub fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl ControllerService for CountingController {
    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(Response::new(HealthCheckResponse {
            status: "ok".to_string(),
        }))
    }

    async fn check_conn_state(
        &self,
        _request: Request<CheckConnStateRequest>,
    ) -> Result<Response<CheckConnStateResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(CheckConnStateResponse {
            registered: true,
            ..CheckConnStateResponse::default()
        }))
    }

    async fn un_register(
        &self,
        _request: Request<UnRegisterRequest>,
    ) -> Result<Response<UnRegisterResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(UnRegisterResponse { result: true }))
    }
}

// =============================================================================
// Running Listener
// =============================================================================

/// A listener started on a spawned task.
pub struct Running {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServerError>>,
}

/// Start `stub` behind the token gate and wait until it serves.
pub async fn serve_stub(
    pki: &ChannelPki,
    stub: Arc<CountingController>,
    settings: ListenerSettings,
) -> Running {
    install_crypto_provider();
    let server = GatewayServer::new("peer", settings);
    let handle = server.handle();
    let material = pki.material();
    let services = ServiceSet::new().add_service(ControllerServiceServer::from_arc(stub));

    let task = tokio::spawn(async move {
        server
            .start(&material, TokenInterceptor::default(), services)
            .await
    });

    assert!(handle.wait_for_state(ServerState::Serving).await);
    let addr = handle.local_addr().unwrap();
    Running { handle, addr, task }
}
