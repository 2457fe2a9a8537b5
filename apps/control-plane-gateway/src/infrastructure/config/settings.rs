//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::auth::{DEFAULT_ENROLLMENT_METHOD, EnrollmentPolicy};
use crate::infrastructure::tls::{TlsError, TlsMaterial};

/// Listener and advertised port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Peer/management gRPC listener port.
    pub grpc_port: u16,
    /// Enrollment gRPC listener port.
    pub bootstrap_port: u16,
    /// Network-service port advertised to enrolled nodes.
    pub network_port: u16,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            grpc_port: 6440,
            bootstrap_port: 6439,
            network_port: 6441,
        }
    }
}

/// Settings that shape listener behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Address the listeners bind (default: all interfaces).
    pub bind_ip: IpAddr,
    /// Health/metrics HTTP port (0 = disabled).
    pub health_port: u16,
    /// Upper bound on graceful drain (`None` = wait indefinitely).
    pub drain_timeout: Option<Duration>,
    /// Register the gRPC reflection service.
    pub reflection_enabled: bool,
    /// Method names that form the enrollment surface.
    pub enrollment_methods: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            health_port: 8086,
            drain_timeout: Some(Duration::from_secs(30)),
            reflection_enabled: true,
            enrollment_methods: vec![DEFAULT_ENROLLMENT_METHOD.to_string()],
        }
    }
}

impl GatewaySettings {
    /// Enrollment policy built from the configured method names.
    #[must_use]
    pub fn enrollment_policy(&self) -> EnrollmentPolicy {
        EnrollmentPolicy::new(&self.enrollment_methods)
    }
}

/// Complete gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Listener ports.
    pub endpoint: ServerEndpoint,
    /// Address advertised to enrolling nodes.
    pub advertise_ip: Option<IpAddr>,
    /// Peer channel TLS material.
    pub peer_tls: TlsMaterial,
    /// Enrollment channel TLS material.
    pub bootstrap_tls: TlsMaterial,
    /// Listener behaviour.
    pub settings: GatewaySettings,
    /// Accepted bootstrap tokens.
    pub bootstrap_tokens: Vec<String>,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let endpoint_defaults = ServerEndpoint::default();
        let settings_defaults = GatewaySettings::default();

        let endpoint = ServerEndpoint {
            grpc_port: env.parse("GATEWAY_GRPC_PORT", endpoint_defaults.grpc_port)?,
            bootstrap_port: env.parse("GATEWAY_BOOTSTRAP_PORT", endpoint_defaults.bootstrap_port)?,
            network_port: env.parse("GATEWAY_NETWORK_PORT", endpoint_defaults.network_port)?,
        };

        let advertise_ip = env
            .optional("GATEWAY_ADVERTISE_IP")
            .map(|v| {
                v.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidValue("GATEWAY_ADVERTISE_IP".to_string(), v))
            })
            .transpose()?;

        let drain_secs: u64 = env.parse(
            "GATEWAY_DRAIN_TIMEOUT_SECS",
            settings_defaults
                .drain_timeout
                .map_or(0, |d| d.as_secs()),
        )?;

        let settings = GatewaySettings {
            bind_ip: env.parse("GATEWAY_BIND_IP", settings_defaults.bind_ip)?,
            health_port: env.parse("GATEWAY_HEALTH_PORT", settings_defaults.health_port)?,
            drain_timeout: (drain_secs > 0).then(|| Duration::from_secs(drain_secs)),
            reflection_enabled: env.flag(
                "GATEWAY_REFLECTION_ENABLED",
                settings_defaults.reflection_enabled,
            ),
            enrollment_methods: env
                .list("GATEWAY_ENROLLMENT_METHODS")
                .unwrap_or(settings_defaults.enrollment_methods),
        };

        Ok(Self {
            endpoint,
            advertise_ip,
            peer_tls: env.tls_material("GATEWAY_GRPC")?,
            bootstrap_tls: env.tls_material("GATEWAY_BOOTSTRAP")?,
            settings,
            bootstrap_tokens: env.list("GATEWAY_BOOTSTRAP_TOKENS").unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("endpoint", &self.endpoint)
            .field("advertise_ip", &self.advertise_ip)
            .field("peer_tls", &self.peer_tls)
            .field("bootstrap_tls", &self.bootstrap_tls)
            .field("settings", &self.settings)
            .field("bootstrap_tokens", &"[REDACTED]")
            .finish()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {0} has invalid value {1:?}")]
    InvalidValue(String, String),
    /// TLS paths for a channel are inconsistent.
    #[error("{prefix} TLS configuration is invalid: {source}")]
    Tls {
        /// Variable prefix of the channel.
        prefix: String,
        /// Underlying TLS error.
        #[source]
        source: TlsError,
    },
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank value.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.optional(key).map_or(Ok(default), |v| {
            v.parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), v))
        })
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.optional(key).map_or(default, |v| {
            !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off")
        })
    }

    /// Comma-separated list; `None` when unset.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.optional(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    fn tls_material(&self, prefix: &str) -> Result<TlsMaterial, ConfigError> {
        let path = |suffix: &str| self.optional(&format!("{prefix}_{suffix}")).map(PathBuf::from);

        let ca_cert = PathBuf::from(self.required(&format!("{prefix}_CA_CERT"))?);
        let client_dir = path("CLIENT_CERT_DIR");

        TlsMaterial::from_parts(
            ca_cert,
            path("CA_KEY"),
            path("SERVER_CERT"),
            path("SERVER_KEY"),
            client_dir.as_deref(),
        )
        .map_err(|source| ConfigError::Tls {
            prefix: prefix.to_string(),
            source,
        })
    }
}
