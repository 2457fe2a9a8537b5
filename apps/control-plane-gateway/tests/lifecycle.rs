//! Listener Lifecycle Integration Tests
//!
//! Start, stop, drain and failure paths of real listeners.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use control_plane_gateway::proto::HealthCheckRequest;
use control_plane_gateway::proto::controller_service_client::ControllerServiceClient;
use control_plane_gateway::{
    AdvertisedEndpoint, GatewayInstance, GatewayServer, NodeControlService, ServerEndpoint,
    ServerError, ServerState, ServiceSet, TlsMaterial, TokenInterceptor, TokenRegistry,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{ChannelPki, CountingController, install_crypto_provider, loopback, serve_stub};

#[tokio::test]
async fn stop_is_idempotent_and_releases_port() {
    let pki = ChannelPki::generate("peer-ca");
    let running = serve_stub(&pki, Arc::new(CountingController::default()), loopback(0)).await;
    assert_eq!(running.handle.state(), ServerState::Serving);

    running.handle.stop();
    running.handle.stop();
    timeout(Duration::from_secs(10), running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    running.handle.stop();

    assert_eq!(running.handle.state(), ServerState::Stopped);
    assert!(std::net::TcpListener::bind(running.addr).is_ok());
}

#[tokio::test]
async fn stop_before_serving_drains_immediately() {
    install_crypto_provider();
    let pki = ChannelPki::generate("peer-ca");
    let server = GatewayServer::new("peer", loopback(0));
    let handle = server.handle();
    handle.stop();

    let result = timeout(
        Duration::from_secs(10),
        server.start(&pki.material(), TokenInterceptor::default(), ServiceSet::new()),
    )
    .await
    .unwrap();

    assert!(result.is_ok());
    assert_eq!(handle.state(), ServerState::Stopped);
}

#[tokio::test]
async fn bind_failure_on_occupied_port() {
    install_crypto_provider();
    let pki = ChannelPki::generate("peer-ca");
    let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();

    let server = GatewayServer::new("peer", loopback(port));
    let handle = server.handle();
    let err = server
        .start(&pki.material(), TokenInterceptor::default(), ServiceSet::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::Bind { addr, .. } if addr.port() == port));
    assert_eq!(handle.state(), ServerState::Stopped);
    drop(occupant);
}

#[tokio::test]
async fn missing_server_key_never_binds() {
    install_crypto_provider();
    let pki = ChannelPki::generate("peer-ca");
    let material = TlsMaterial::new(
        pki.path("ca.pem"),
        pki.path("server.pem"),
        pki.path("missing-key.pem"),
    );

    let server = GatewayServer::new("peer", loopback(0));
    let handle = server.handle();
    let err = server
        .start(&material, TokenInterceptor::default(), ServiceSet::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ServerError::Configuration(_)));
    assert_eq!(handle.state(), ServerState::Stopped);
    assert_eq!(handle.local_addr(), None);
}

#[tokio::test]
async fn drain_deadline_force_closes_stalled_call() {
    let pki = ChannelPki::generate("peer-ca");
    let stub = Arc::new(CountingController::stalling());
    let settings = loopback(0).with_drain_timeout(Some(Duration::from_millis(300)));
    let running = serve_stub(&pki, Arc::clone(&stub), settings).await;

    let channel = common::connect(running.addr, pki.client_tls()).await.unwrap();
    let call = tokio::spawn(async move {
        ControllerServiceClient::new(channel)
            .health_check(common::with_token(HealthCheckRequest {}, "node-token", "abc"))
            .await
    });
    stub.entered.notified().await;

    running.handle.stop();
    let err = timeout(Duration::from_secs(10), running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    assert!(matches!(
        err,
        ServerError::ShutdownTimeout(limit) if limit == Duration::from_millis(300)
    ));
    assert_eq!(running.handle.state(), ServerState::Stopped);
    call.abort();
}

#[tokio::test]
async fn instance_stops_peer_when_bootstrap_cannot_bind() {
    install_crypto_provider();
    let peer = ChannelPki::generate("peer-ca");
    let bootstrap = ChannelPki::generate("bootstrap-ca");
    let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = ServerEndpoint {
        grpc_port: 0,
        bootstrap_port: occupant.local_addr().unwrap().port(),
        network_port: 0,
    };

    let (tx, _rx) = mpsc::channel(1);
    let service = NodeControlService::new(
        Arc::new(TokenRegistry::new(["boot-1"])),
        AdvertisedEndpoint::new([127, 0, 0, 1].into(), &endpoint),
        peer.material(),
        tx.clone(),
    );
    let instance = GatewayInstance::new(
        Arc::new(service),
        &endpoint,
        loopback(0),
        loopback(0),
        peer.material(),
        bootstrap.material(),
        TokenInterceptor::default(),
        tx,
    );
    let handle = instance.handle();

    let err = timeout(Duration::from_secs(10), instance.run())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, ServerError::Bind { .. }));
    assert_eq!(handle.peer().state(), ServerState::Stopped);
    assert_eq!(handle.bootstrap().state(), ServerState::Stopped);
    assert!(!handle.is_ready());
    drop(occupant);
}
