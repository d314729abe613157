//! blockcsi: CSI plugin process for cloud block storage.
//!
//! One binary serves every role; `--mode` picks the controller deployment,
//! the per-node daemon set, or both for single-process test clusters.

mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libcsi::cloud::http::HttpCloudClient;
use libcsi::cloud::{CloudClient, resolve_instance};
use libcsi::mount::system::{OsFileSystem, SystemExecutor, SystemMounter};
use libcsi::mount::{Executor, FileSystem, Mounter};
use libcsi::poll::Poller;
use libcsi::transport::{CsiServices, serve};
use libcsi::{ControllerService, IdentityService, MetricsSink, NodeService, OperationMetrics};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = args.driver_config();
    config.validate().context("invalid configuration")?;
    info!(
        driver = %config.driver_name,
        version = %config.vendor_version,
        mode = %config.mode,
        endpoint = %config.endpoint,
        "starting CSI plugin"
    );

    let user_agent = format!("{}/{}", config.driver_name, config.vendor_version);
    let cloud: Arc<dyn CloudClient> = Arc::new(
        HttpCloudClient::new(&config.api_url, &config.api_token, &user_agent)
            .context("building API client")?,
    );
    let metrics = Arc::new(OperationMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = config.mode.runs_controller().then(|| {
        let poller = Poller::new(config.poll_interval, config.poll_timeout, shutdown_rx.clone());
        ControllerService::new(cloud.clone(), &config, poller, sink.clone())
    });

    let node = if config.mode.runs_node() {
        let instance = resolve_instance(
            cloud.as_ref(),
            &config.node_name,
            config.instance_id_file.as_deref(),
        )
        .await
        .context("resolving this node's instance")?;
        let exec: Arc<dyn Executor> = Arc::new(SystemExecutor);
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        let mounter: Arc<dyn Mounter> = Arc::new(SystemMounter::new(exec.clone()));
        Some(NodeService::new(instance, mounter, fs, exec, sink.clone()))
    } else {
        None
    };

    let services = CsiServices {
        identity: IdentityService::new(
            config.driver_name.clone(),
            config.vendor_version.clone(),
            shutdown_rx.clone(),
            sink.clone(),
        ),
        controller,
        node,
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    serve(&config, services, shutdown_rx)
        .await
        .context("serving CSI")?;
    metrics.log_summary();
    Ok(())
}
