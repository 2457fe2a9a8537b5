//! Call Authentication Policy
//!
//! Pure types for the token gate that sits in front of every RPC:
//! method classification, the credential each class requires, and the
//! rejection taxonomy.
//!
//! # Two-tier credentials
//!
//! - **Enrollment** methods (token issuance for nodes that are not yet
//!   enrolled) require a `bootstrap-token` metadata entry.
//! - **Established** methods (everything else) require a `node-token`.
//! - **Introspection** (server reflection) needs no token; the channel is
//!   still mutually authenticated.
//!
//! The gate checks presence only. Token *values* are checked downstream by
//! the business layer (see `application::services::TokenRegistry`).

use std::collections::BTreeSet;
use std::fmt;

/// Metadata key carrying the enrollment credential.
pub const BOOTSTRAP_TOKEN_KEY: &str = "bootstrap-token";

/// Metadata key carrying the enrolled-node credential.
pub const NODE_TOKEN_KEY: &str = "node-token";

/// Enrollment method recognised when no explicit set is configured.
pub const DEFAULT_ENROLLMENT_METHOD: &str = "GetToken";

/// Reflection services exempt from token checks.
const INTROSPECTION_SERVICES: [&str; 2] = [
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

// =============================================================================
// Credential Kinds
// =============================================================================

/// Which token a call must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Enrollment credential for not-yet-enrolled nodes.
    Bootstrap,
    /// Credential issued to an enrolled node.
    Node,
}

impl CredentialKind {
    /// Metadata key this credential travels under.
    #[must_use]
    pub const fn metadata_key(self) -> &'static str {
        match self {
            Self::Bootstrap => BOOTSTRAP_TOKEN_KEY,
            Self::Node => NODE_TOKEN_KEY,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metadata_key())
    }
}

/// A token found in call metadata, attached to the request once admitted.
///
/// The value is opaque here; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct PresentedCredential {
    kind: CredentialKind,
    value: String,
}

impl PresentedCredential {
    /// Create a presented credential.
    #[must_use]
    pub fn new(kind: CredentialKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Credential kind.
    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// Raw token value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for PresentedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentedCredential")
            .field("kind", &self.kind)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Method Classification
// =============================================================================

/// Authentication class of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodClass {
    /// Token issuance for nodes without a node token.
    Enrollment,
    /// Any call from an enrolled node.
    Established,
    /// Server reflection.
    Introspection,
}

impl MethodClass {
    /// Credential a call of this class must present, if any.
    #[must_use]
    pub const fn required_credential(self) -> Option<CredentialKind> {
        match self {
            Self::Enrollment => Some(CredentialKind::Bootstrap),
            Self::Established => Some(CredentialKind::Node),
            Self::Introspection => None,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::Established => "established",
            Self::Introspection => "introspection",
        }
    }
}

/// Split a gRPC path (`/package.Service/Method`) into service and method.
#[must_use]
pub fn split_method_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (service, method) = trimmed.rsplit_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// Names of methods that form the enrollment surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentPolicy {
    methods: BTreeSet<String>,
}

impl EnrollmentPolicy {
    /// Build a policy from method names (the last segment of the path).
    ///
    /// Blank names are ignored; an empty result falls back to
    /// [`DEFAULT_ENROLLMENT_METHOD`].
    #[must_use]
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let methods: BTreeSet<String> = methods
            .into_iter()
            .map(|m| m.as_ref().trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        if methods.is_empty() {
            return Self::default();
        }
        Self { methods }
    }

    /// Configured enrollment method names.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Classify a full method path.
    ///
    /// Unparseable paths are treated as established, so they still need a
    /// node token.
    #[must_use]
    pub fn classify(&self, path: &str) -> MethodClass {
        let Some((service, method)) = split_method_path(path) else {
            return MethodClass::Established;
        };

        if INTROSPECTION_SERVICES.contains(&service) {
            MethodClass::Introspection
        } else if self.methods.contains(method) {
            MethodClass::Enrollment
        } else {
            MethodClass::Established
        }
    }
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            methods: BTreeSet::from([DEFAULT_ENROLLMENT_METHOD.to_string()]),
        }
    }
}

// =============================================================================
// Per-call Context and Decision
// =============================================================================

/// What the gate sees of one inbound call. Built per call and dropped with it.
pub struct AuthContext<'a, M> {
    /// Full method path.
    pub method: &'a str,
    /// Call metadata.
    pub metadata: &'a M,
}

/// Read-only view over call metadata.
pub trait MetadataView {
    /// True when the call carried no metadata at all.
    fn is_empty(&self) -> bool;

    /// Value for `key`, if present. Non-text values read as empty.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<'a, M: MetadataView> AuthContext<'a, M> {
    /// Create a context for one call.
    #[must_use]
    pub const fn new(method: &'a str, metadata: &'a M) -> Self {
        Self { method, metadata }
    }

    /// Decide whether the call may proceed.
    ///
    /// # Errors
    ///
    /// - [`AuthRejection::NoMetadata`] when the call carried no metadata.
    /// - [`AuthRejection::MissingToken`] when the required key is absent.
    pub fn authorize(&self, policy: &EnrollmentPolicy) -> Result<Admission, AuthRejection> {
        let class = policy.classify(self.method);

        if self.metadata.is_empty() {
            return Err(AuthRejection::NoMetadata);
        }

        let Some(kind) = class.required_credential() else {
            return Ok(Admission {
                class,
                credential: None,
            });
        };

        let value = self
            .metadata
            .get(kind.metadata_key())
            .ok_or(AuthRejection::MissingToken(kind))?;

        Ok(Admission {
            class,
            credential: Some(PresentedCredential::new(kind, value)),
        })
    }
}

/// Outcome of a successful gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Class the method was placed in.
    pub class: MethodClass,
    /// Token carried by the call; `None` for introspection.
    pub credential: Option<PresentedCredential>,
}

/// Why the gate refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    /// The call carried no metadata at all.
    #[error("no metadata")]
    NoMetadata,
    /// The token required by the method class was absent.
    #[error("missing {0}")]
    MissingToken(CredentialKind),
}

impl AuthRejection {
    /// Message returned to the caller.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoMetadata => "no metadata",
            Self::MissingToken(CredentialKind::Bootstrap) => "missing bootstrap-token",
            Self::MissingToken(CredentialKind::Node) => "missing node-token",
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::NoMetadata => "no_metadata",
            Self::MissingToken(CredentialKind::Bootstrap) => "missing_bootstrap_token",
            Self::MissingToken(CredentialKind::Node) => "missing_node_token",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
