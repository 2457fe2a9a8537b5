//! Token Gate
//!
//! A tower layer installed on the whole tonic server, ahead of routing, so
//! it sees the full method path of every call on every registered service.
//! Calls that lack the required token are answered with a gRPC error
//! directly from the layer and never reach a handler.
//!
//! | Method class  | Required key      | Missing key |
//! |---------------|-------------------|-------------|
//! | enrollment    | `bootstrap-token` | `ABORTED`   |
//! | established   | `node-token`      | `ABORTED`   |
//! | introspection | none              | n/a         |
//!
//! A call with no metadata at all is `UNAUTHENTICATED`.
//!
//! Admitted calls carry a [`PresentedCredential`] in their request
//! extensions. Presence is all this layer checks: handlers must still
//! validate the value (see `NodeControlService`).

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{Either, Ready, ready};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use tonic::{Code, Status};
use tower::{Layer, Service};

use crate::domain::auth::{
    Admission, AuthContext, AuthRejection, EnrollmentPolicy, MetadataView, PresentedCredential,
};
use crate::infrastructure::metrics;

const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");

impl MetadataView for HeaderMap {
    fn is_empty(&self) -> bool {
        Self::is_empty(self)
    }

    fn get(&self, key: &str) -> Option<&str> {
        Self::get(self, key).map(|v| v.to_str().unwrap_or_default())
    }
}

impl From<AuthRejection> for Status {
    fn from(rejection: AuthRejection) -> Self {
        Self::new(rejection_code(rejection), rejection.message())
    }
}

const fn rejection_code(rejection: AuthRejection) -> Code {
    match rejection {
        AuthRejection::NoMetadata => Code::Unauthenticated,
        AuthRejection::MissingToken(_) => Code::Aborted,
    }
}

// =============================================================================
// Interceptor
// =============================================================================

/// Token presence check shared by every listener.
#[derive(Debug, Clone, Default)]
pub struct TokenInterceptor {
    policy: Arc<EnrollmentPolicy>,
}

impl TokenInterceptor {
    /// Create an interceptor for the given enrollment policy.
    #[must_use]
    pub fn new(policy: EnrollmentPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// Enrollment policy in force.
    #[must_use]
    pub fn policy(&self) -> &EnrollmentPolicy {
        &self.policy
    }

    /// Check one call.
    ///
    /// # Errors
    ///
    /// The [`AuthRejection`] to report to the caller.
    pub fn check(&self, method: &str, headers: &HeaderMap) -> Result<Admission, AuthRejection> {
        let outcome = AuthContext::new(method, headers).authorize(&self.policy);

        match &outcome {
            Ok(admission) => metrics::record_rpc_admitted(admission.class),
            Err(rejection) => {
                metrics::record_rpc_rejected(*rejection);
                tracing::warn!(
                    method,
                    reason = rejection.reason(),
                    "Rejected RPC at token gate"
                );
            }
        }

        outcome
    }

    /// Tower layer enforcing this interceptor.
    #[must_use]
    pub fn layer(&self) -> TokenGateLayer {
        TokenGateLayer {
            interceptor: self.clone(),
        }
    }
}

// =============================================================================
// Tower Layer / Service
// =============================================================================

/// Layer producing [`TokenGate`] services.
#[derive(Debug, Clone)]
pub struct TokenGateLayer {
    interceptor: TokenInterceptor,
}

impl<S> Layer<S> for TokenGateLayer {
    type Service = TokenGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TokenGate {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Service that admits or rejects each call before `inner` sees it.
#[derive(Debug, Clone)]
pub struct TokenGate<S> {
    inner: S,
    interceptor: TokenInterceptor,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TokenGate<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Either<S::Future, Ready<Result<Self::Response, Self::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        match self
            .interceptor
            .check(request.uri().path(), request.headers())
        {
            Ok(Admission { credential, .. }) => {
                if let Some(credential) = credential {
                    request
                        .extensions_mut()
                        .insert::<PresentedCredential>(credential);
                }
                Either::Left(self.inner.call(request))
            }
            Err(rejection) => Either::Right(ready(Ok(rejection_response(rejection)))),
        }
    }
}

/// Trailers-only gRPC error response.
fn rejection_response<B: Default>(rejection: AuthRejection) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        HeaderValue::from(rejection_code(rejection) as i32),
    );
    headers.insert(GRPC_MESSAGE, HeaderValue::from_static(rejection.message()));
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

// =============================================================================
// Tests
// =============================================================================
