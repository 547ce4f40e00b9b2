//! Server-wide injector configuration.
//!
//! Values come from command-line flags with environment fallbacks and are
//! validated once at startup. After that the configuration is shared behind
//! an `Arc` and never mutated.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::error::{Error, Result};

/// Default webhook server port
pub const DEFAULT_PORT: u16 = 8080;
/// Default path to webhook TLS certificate
pub const DEFAULT_TLS_CERT: &str = "/etc/webhook/certs/cert.pem";
/// Default path to webhook TLS private key
pub const DEFAULT_TLS_KEY: &str = "/etc/webhook/certs/key.pem";
/// Default proxy image
pub const DEFAULT_SIDECAR_IMAGE: &str =
    "840364872350.dkr.ecr.us-west-2.amazonaws.com/aws-appmesh-envoy:v1.12.1.1-prod";
/// Default traffic redirection image
pub const DEFAULT_INIT_IMAGE: &str =
    "111345817488.dkr.ecr.us-west-2.amazonaws.com/aws-appmesh-proxy-route-manager:v2";
pub const DEFAULT_SIDECAR_CPU_REQUESTS: &str = "10m";
pub const DEFAULT_SIDECAR_MEMORY_REQUESTS: &str = "32Mi";
/// Instance metadata endpoint, never redirected through the proxy
pub const DEFAULT_IGNORED_IPS: &str = "169.254.169.254";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_JAEGER_ADDRESS: &str = "appmesh-jaeger.appmesh-system";
pub const DEFAULT_JAEGER_PORT: &str = "9411";
pub const DEFAULT_DATADOG_ADDRESS: &str = "datadog.appmesh-system";
pub const DEFAULT_DATADOG_PORT: &str = "8126";
/// Seconds to wait for in-flight requests on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Address of a tracing collector reachable from the pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collector {
    pub address: String,
    pub port: String,
}

/// The single tracing backend wired into an injected proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracingBackend {
    /// Zipkin-compatible Jaeger collector, configured through a static file
    Jaeger(Collector),
    /// Datadog agent, configured through a static file
    Datadog(Collector),
    /// AWS X-Ray daemon sidecar
    XRay,
}

impl TracingBackend {
    /// Collector that needs a static proxy config file, if any
    pub fn collector(&self) -> Option<&Collector> {
        match self {
            TracingBackend::Jaeger(c) | TracingBackend::Datadog(c) => Some(c),
            TracingBackend::XRay => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TracingBackend::Jaeger(_) => "jaeger",
            TracingBackend::Datadog(_) => "datadog",
            TracingBackend::XRay => "xray",
        }
    }
}

/// Injector configuration
#[derive(Parser, Clone, Debug)]
#[command(
    name = "appmesh-inject",
    version,
    about = "Mutating admission webhook that injects the App Mesh proxy into pods"
)]
pub struct ServerConfig {
    /// Port the webhook listens on
    #[arg(long, env = "APPMESH_WEBHOOK_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Location of TLS cert file
    #[arg(long = "tlscert", default_value = DEFAULT_TLS_CERT)]
    pub tls_cert: PathBuf,

    /// Location of TLS key file
    #[arg(long = "tlskey", default_value = DEFAULT_TLS_KEY)]
    pub tls_key: PathBuf,

    /// Serve plain HTTP (no TLS)
    #[arg(long)]
    pub dev: bool,

    /// Seconds to wait for in-flight requests during shutdown
    #[arg(long = "shutdown-timeout", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: u64,

    /// Inject into pods without an explicit sidecarInjectorWebhook annotation
    #[arg(
        long,
        env = "APPMESH_INJECT_DEFAULT",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub inject_default: bool,

    /// Set fsGroup 1337 on pods without one so the proxy can read projected tokens
    #[arg(long)]
    pub enable_iam_for_service_accounts: bool,

    /// App Mesh name
    #[arg(long, env = "APPMESH_NAME")]
    pub mesh_name: String,

    /// App Mesh region
    #[arg(long, env = "APPMESH_REGION", default_value = "")]
    pub region: String,

    /// Proxy log level
    #[arg(long, env = "APPMESH_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Use the App Mesh preview channel
    #[arg(long, env = "APPMESH_PREVIEW")]
    pub preview: bool,

    /// Inject the ECR image pull secret
    #[arg(long)]
    pub ecr_secret: bool,

    /// Proxy sidecar image
    #[arg(long, default_value = DEFAULT_SIDECAR_IMAGE)]
    pub sidecar_image: String,

    /// Proxy CPU requests
    #[arg(long, default_value = DEFAULT_SIDECAR_CPU_REQUESTS)]
    pub sidecar_cpu_requests: String,

    /// Proxy memory requests
    #[arg(long, default_value = DEFAULT_SIDECAR_MEMORY_REQUESTS)]
    pub sidecar_memory_requests: String,

    /// Traffic redirection init container image
    #[arg(long, default_value = DEFAULT_INIT_IMAGE)]
    pub init_image: String,

    /// Comma separated egress IPs excluded from redirection
    #[arg(long, default_value = DEFAULT_IGNORED_IPS)]
    pub ignored_ips: String,

    /// Inject the AWS X-Ray daemon sidecar
    #[arg(long)]
    pub inject_xray_sidecar: bool,

    /// Enable proxy stats tags
    #[arg(long)]
    pub enable_stats_tags: bool,

    /// Enable proxy DogStatsD output
    #[arg(long)]
    pub enable_statsd: bool,

    /// Inject the StatsD exporter sidecar
    #[arg(long)]
    pub inject_statsd_exporter_sidecar: bool,

    /// Wire the proxy to a Jaeger collector
    #[arg(long)]
    pub enable_jaeger_tracing: bool,

    #[arg(long, default_value = DEFAULT_JAEGER_ADDRESS)]
    pub jaeger_address: String,

    #[arg(long, default_value = DEFAULT_JAEGER_PORT)]
    pub jaeger_port: String,

    /// Wire the proxy to a Datadog agent
    #[arg(long)]
    pub enable_datadog_tracing: bool,

    #[arg(long, default_value = DEFAULT_DATADOG_ADDRESS)]
    pub datadog_address: String,

    #[arg(long, default_value = DEFAULT_DATADOG_PORT)]
    pub datadog_port: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tls_cert: PathBuf::from(DEFAULT_TLS_CERT),
            tls_key: PathBuf::from(DEFAULT_TLS_KEY),
            dev: false,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            inject_default: true,
            enable_iam_for_service_accounts: false,
            mesh_name: String::new(),
            region: String::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            preview: false,
            ecr_secret: false,
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            sidecar_cpu_requests: DEFAULT_SIDECAR_CPU_REQUESTS.to_string(),
            sidecar_memory_requests: DEFAULT_SIDECAR_MEMORY_REQUESTS.to_string(),
            init_image: DEFAULT_INIT_IMAGE.to_string(),
            ignored_ips: DEFAULT_IGNORED_IPS.to_string(),
            inject_xray_sidecar: false,
            enable_stats_tags: false,
            enable_statsd: false,
            inject_statsd_exporter_sidecar: false,
            enable_jaeger_tracing: false,
            jaeger_address: DEFAULT_JAEGER_ADDRESS.to_string(),
            jaeger_port: DEFAULT_JAEGER_PORT.to_string(),
            enable_datadog_tracing: false,
            datadog_address: DEFAULT_DATADOG_ADDRESS.to_string(),
            datadog_port: DEFAULT_DATADOG_PORT.to_string(),
        }
    }
}

impl ServerConfig {
    /// Check if more than one tracing backend is enabled
    pub fn multiple_tracers(&self) -> bool {
        let enabled = [
            self.enable_jaeger_tracing,
            self.enable_datadog_tracing,
            self.inject_xray_sidecar,
        ];
        enabled.iter().filter(|e| **e).count() > 1
    }

    /// Reject configurations the injector cannot serve.
    ///
    /// This is the only place tracing backend exclusivity is checked; every
    /// later stage sees at most one [`TracingBackend`].
    pub fn validate(&self) -> Result<()> {
        if self.multiple_tracers() {
            return Err(Error::Config(
                "only one of Jaeger, Datadog or X-Ray tracing may be enabled".to_string(),
            ));
        }
        if self.mesh_name.trim().is_empty() {
            return Err(Error::Config("mesh name must not be empty".to_string()));
        }
        if self.sidecar_image.trim().is_empty() {
            return Err(Error::Config("sidecar image must not be empty".to_string()));
        }
        if self.init_image.trim().is_empty() {
            return Err(Error::Config("init image must not be empty".to_string()));
        }
        Ok(())
    }

    /// Tracing backend selected by flags
    pub fn tracing_backend(&self) -> Option<TracingBackend> {
        if self.enable_jaeger_tracing {
            Some(TracingBackend::Jaeger(self.jaeger_collector()))
        } else if self.enable_datadog_tracing {
            Some(TracingBackend::Datadog(self.datadog_collector()))
        } else if self.inject_xray_sidecar {
            Some(TracingBackend::XRay)
        } else {
            None
        }
    }

    pub fn jaeger_collector(&self) -> Collector {
        Collector {
            address: self.jaeger_address.clone(),
            port: self.jaeger_port.clone(),
        }
    }

    pub fn datadog_collector(&self) -> Collector {
        Collector {
            address: self.datadog_address.clone(),
            port: self.datadog_port.clone(),
        }
    }
}
