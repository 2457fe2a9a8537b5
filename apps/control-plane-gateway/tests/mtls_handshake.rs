//! Mutual-TLS Handshake Integration Tests
//!
//! A listener only talks to clients presenting a certificate issued by its
//! own CA.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use control_plane_gateway::ServerState;
use control_plane_gateway::proto::HealthCheckRequest;
use control_plane_gateway::proto::controller_service_client::ControllerServiceClient;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tonic::transport::ClientTlsConfig;

use common::{Authority, ChannelPki, CountingController, client_tls, loopback, serve_stub};

/// Dial and issue one HealthCheck; `true` if the call succeeded.
async fn call_succeeds(addr: std::net::SocketAddr, tls: ClientTlsConfig) -> bool {
    let Ok(channel) = common::connect(addr, tls).await else {
        return false;
    };
    let mut client = ControllerServiceClient::new(channel);
    let call = client.health_check(common::with_token(HealthCheckRequest {}, "node-token", "abc"));
    matches!(timeout(Duration::from_secs(5), call).await, Ok(Ok(_)))
}

#[tokio::test]
async fn trusted_client_certificate_is_accepted() {
    let pki = ChannelPki::generate("peer-ca");
    let stub = Arc::new(CountingController::default());
    let running = serve_stub(&pki, Arc::clone(&stub), loopback(0)).await;

    assert!(call_succeeds(running.addr, pki.client_tls()).await);
    assert_eq!(stub.calls(), 1);

    running.handle.stop();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn client_without_certificate_is_rejected() {
    let pki = ChannelPki::generate("peer-ca");
    let stub = Arc::new(CountingController::default());
    let running = serve_stub(&pki, Arc::clone(&stub), loopback(0)).await;

    assert!(!call_succeeds(running.addr, client_tls(&pki.ca_pem, None)).await);
    assert_eq!(stub.calls(), 0);

    running.handle.stop();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn certificate_from_foreign_ca_is_rejected() {
    let pki = ChannelPki::generate("peer-ca");
    let foreign = Authority::new("foreign-ca");
    let (cert, key) = foreign.issue_client();
    let stub = Arc::new(CountingController::default());
    let running = serve_stub(&pki, Arc::clone(&stub), loopback(0)).await;

    let tls = client_tls(&pki.ca_pem, Some((&cert, &key)));
    assert!(!call_succeeds(running.addr, tls).await);
    assert_eq!(stub.calls(), 0);

    running.handle.stop();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn client_of_other_channel_is_rejected() {
    let peer = ChannelPki::generate("peer-ca");
    let bootstrap = ChannelPki::generate("bootstrap-ca");
    let stub = Arc::new(CountingController::default());
    let running = serve_stub(&peer, Arc::clone(&stub), loopback(0)).await;

    // Trusts the peer server but presents the bootstrap client identity.
    let tls = client_tls(
        &peer.ca_pem,
        Some((&bootstrap.client_cert_pem, &bootstrap.client_key_pem)),
    );
    assert!(!call_succeeds(running.addr, tls).await);
    assert_eq!(stub.calls(), 0);

    running.handle.stop();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_handshakes_do_not_stop_the_listener() {
    let pki = ChannelPki::generate("peer-ca");
    let foreign = Authority::new("foreign-ca");
    let (cert, key) = foreign.issue_client();
    let stub = Arc::new(CountingController::default());
    let running = serve_stub(&pki, Arc::clone(&stub), loopback(0)).await;

    assert!(!call_succeeds(running.addr, client_tls(&pki.ca_pem, None)).await);
    assert!(!call_succeeds(running.addr, client_tls(&pki.ca_pem, Some((&cert, &key)))).await);

    // Connected but never sends a ClientHello.
    let idle = TcpStream::connect(running.addr).await.unwrap();

    assert!(call_succeeds(running.addr, pki.client_tls()).await);
    assert_eq!(stub.calls(), 1);
    assert_eq!(running.handle.state(), ServerState::Serving);

    drop(idle);
    running.handle.stop();
    running.task.await.unwrap().unwrap();
}
