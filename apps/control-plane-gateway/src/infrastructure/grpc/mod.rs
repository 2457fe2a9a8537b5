//! gRPC Transport
//!
//! Everything between the TCP socket and the controller handlers.
//!
//! # Architecture
//!
//! ```text
//! TcpListener ─► mTLS handshake ─► TokenGate layer ─► reflection / services
//!                (MtlsCredential)   (TokenInterceptor)
//! ```
//!
//! - `interceptor`: token gate applied to every route of a server
//! - `server`: one listener's lifecycle (start, serve, drain, stop)
//! - `instance`: the peer and bootstrap listeners run together
//! - `controller`: reference `BootstrapService` / `ControllerService`

pub mod controller;
pub mod instance;
pub mod interceptor;
pub mod server;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod controller {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/controller.v1.rs"));
        }
    }
}

/// Encoded descriptor set for the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/controller_descriptor.bin"));

pub use controller::{AdvertisedEndpoint, NodeControlService};
pub use instance::{GatewayInstance, InstanceHandle};
pub use interceptor::TokenInterceptor;
pub use server::{GatewayServer, ListenerSettings, ServerError, ServerHandle, ServiceSet};
