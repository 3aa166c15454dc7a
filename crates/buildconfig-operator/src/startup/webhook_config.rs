//! MutatingWebhookConfiguration for build pod injection
//!
//! Only pods carrying the `config.builds.dev/build` label are sent to the
//! webhook. Failure policy is `Fail`: a build pod is never admitted without
//! the cluster build configuration.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;

use buildconfig_common::{BUILD_LABEL, FIELD_MANAGER};

/// Name of the cluster-scoped MutatingWebhookConfiguration
pub const WEBHOOK_CONFIG_NAME: &str = "buildconfig-pod-mutator";

const WEBHOOK_SERVICE_NAME: &str = "buildconfig-webhook";
const WEBHOOK_NAME: &str = "pods.config.builds.dev";
const WEBHOOK_PATH: &str = "/mutate/pods";

/// Where the webhook is served and how the API server trusts it
#[derive(Clone, Debug)]
pub struct WebhookInstall {
    /// Namespace of the operator and its Service
    pub namespace: String,
    /// Container port the HTTPS server listens on
    pub target_port: u16,
    /// PEM CA bundle the API server uses to verify the serving certificate
    pub ca_bundle: Vec<u8>,
}

fn webhook_service(install: &WebhookInstall) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_SERVICE_NAME.to_string()),
            namespace: Some(install.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(install.target_port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn webhook_configuration(install: &WebhookInstall) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Equivalent".to_string()),
            reinvocation_policy: Some("IfNeeded".to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: WEBHOOK_SERVICE_NAME.to_string(),
                    namespace: install.namespace.clone(),
                    path: Some(WEBHOOK_PATH.to_string()),
                    port: Some(443),
                }),
                ca_bundle: Some(ByteString(install.ca_bundle.clone())),
                ..Default::default()
            },
            object_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: BUILD_LABEL.to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]),
    }
}

/// Ensure the webhook Service and MutatingWebhookConfiguration are installed
pub async fn ensure_webhook_config(client: &Client, install: &WebhookInstall) -> anyhow::Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let services: Api<Service> = Api::namespaced(client.clone(), &install.namespace);
    services
        .patch(
            WEBHOOK_SERVICE_NAME,
            &params,
            &Patch::Apply(&webhook_service(install)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create webhook Service: {}", e))?;

    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    webhooks
        .patch(
            WEBHOOK_CONFIG_NAME,
            &params,
            &Patch::Apply(&webhook_configuration(install)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create MutatingWebhookConfiguration: {}", e))?;

    tracing::info!(name = WEBHOOK_CONFIG_NAME, "Webhook configuration installed");
    Ok(())
}
