//! Startup utilities: CRD and admission webhook installation

mod crds;
mod webhook_config;

pub use crds::ensure_crds_installed;
pub use webhook_config::{ensure_webhook_config, WebhookInstall, WEBHOOK_CONFIG_NAME};
