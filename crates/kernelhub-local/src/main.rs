use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{info, warn};

use kernelhub_local::config::HostConfig;
use kernelhub_local::router::Router;
use kernelhub_protocol::{ApiRequest, ApiResponse, ErrorCode, MAX_JSON_LINE_BYTES};
use libkernelhub::{
    ECHO_KERNEL_NAME, EchoKernel, KernelBroker, KernelBrokerConfig, KernelRegistry, SessionBroker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol stream, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kernelhub=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = HostConfig::load()?;

    let registry = Arc::new(KernelRegistry::new());
    registry.register(ECHO_KERNEL_NAME, EchoKernel::factory()).await;
    if let Some(ref name) = config.default_kernel
        && let Err(err) = registry.set_default(name).await
    {
        warn!(error = %err, "keeping the first registered kernel type as default");
    }

    let kernels = KernelBroker::with_config(
        registry,
        KernelBrokerConfig {
            base_url: config.base_url.clone(),
            ..KernelBrokerConfig::default()
        },
    );
    let sessions = SessionBroker::new(Arc::clone(&kernels));
    let router = Router::new(Arc::clone(&kernels), Arc::clone(&sessions));

    info!(base_url = %config.base_url, "kernelhub started");

    let mut reader = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );
    let mut writer = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());

    while let Some(line) = reader.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(request) => router.handle(request).await,
            Err(err) => {
                ApiResponse::error(format!("invalid request: {err}"), ErrorCode::InvalidRequest)
            }
        };
        writer.send(serde_json::to_string(&response)?).await?;
    }

    // EOF on stdin: cascade everything down before exiting
    if let Err(err) = sessions.shutdown_all().await {
        warn!(error = %err, "session shutdown failed");
    }
    if let Err(err) = kernels.shutdown_all().await {
        warn!(error = %err, "kernel shutdown failed");
    }
    info!("kernelhub stopped");
    Ok(())
}
