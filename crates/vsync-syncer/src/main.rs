//! vsync syncer binary
//!
//! Reads a JSON [`SyncConfig`] from `VSYNC_CONFIG`. The virtual cluster is
//! the ambient kube config; the host cluster comes from the kubeconfig at
//! `VSYNC_HOST_KUBECONFIG`, or the in-cluster config when unset.

use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use vsync_common::{Error, Result, SyncConfig};

const CONFIG_ENV: &str = "VSYNC_CONFIG";
const HOST_KUBECONFIG_ENV: &str = "VSYNC_HOST_KUBECONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(load_config()?);
    let virtual_client = Client::try_default().await?;
    let host_client = host_client().await?;
    vsync_syncer::run(config, virtual_client, host_client, None).await
}

fn load_config() -> Result<SyncConfig> {
    let path = std::env::var(CONFIG_ENV)
        .map_err(|_| Error::setup(format!("{CONFIG_ENV} is not set")))?;
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::setup(format!("reading {path}: {e}")))?;
    let config: SyncConfig = serde_json::from_str(&raw)
        .map_err(|e| Error::setup(format!("parsing {path}: {e}")))?;
    config.validate()?;
    Ok(config)
}

async fn host_client() -> Result<Client> {
    let config = match std::env::var(HOST_KUBECONFIG_ENV) {
        Ok(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .map_err(|e| Error::setup(format!("reading {path}: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::setup(format!("host kubeconfig {path}: {e}")))?
        }
        Err(_) => Config::incluster()
            .map_err(|e| Error::setup(format!("host in-cluster config: {e}")))?,
    };
    Ok(Client::try_from(config)?)
}
