//! CRD installation on startup using server-side apply
//!
//! The operator installs its own CRDs so their schema always matches the
//! running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use buildconfig_common::crd::BuildClusterConfig;
use buildconfig_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn operator_crds() -> Vec<CrdDef> {
    vec![CrdDef {
        name: "buildclusterconfigs.config.builds.dev",
        crd: BuildClusterConfig::crd(),
    }]
}

/// Install a set of CRDs using server-side apply
async fn install_crds(client: &Client, crds_to_install: Vec<CrdDef>) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in crds_to_install {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    Ok(())
}

/// Ensure the BuildClusterConfig CRD is installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    install_crds(client, operator_crds()).await?;
    tracing::info!("Build configuration CRDs installed/updated");
    Ok(())
}
