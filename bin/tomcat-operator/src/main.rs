use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tomcat_core::{
    DesiredStateBuilder, KubeCluster, ManifestTemplates, OperatorConfig, ReconcileEngine,
};
use tracing::{error, info};

mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::from_env().context("invalid operator configuration")?;
    logging::init(config.log_format);

    info!("Starting tomcat-operator...");
    info!(
        "Watching Tomcats in {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );

    let templates = match &config.template_dir {
        Some(dir) => {
            info!("Loading manifest templates from {}", dir.display());
            ManifestTemplates::from_dir(dir)?
        }
        None => ManifestTemplates::embedded()?,
    };
    let builder = DesiredStateBuilder::new(templates, config.base_image.clone());

    let client = Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client, config.namespace.clone()));
    let engine = ReconcileEngine::start(cluster, builder, config.engine());

    let watch = tokio::spawn(engine.primary_watch());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining...");

    engine.shutdown().await;
    if let Err(e) = watch.await {
        error!("Tomcat watch task failed: {}", e);
    }
    info!("tomcat-operator stopped");

    Ok(())
}
