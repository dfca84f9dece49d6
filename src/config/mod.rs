/// TOML configuration and its translation into component settings
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    AlertsConfig, AuditConfig, Config, ExecutorConfig, GuardConfig, LlmBackendConfig, LlmConfig,
    NamedBackend, NotificationConfig, PipelineConfig, ServiceConfig, TierConfig,
};
