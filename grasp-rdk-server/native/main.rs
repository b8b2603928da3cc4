use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use grasp_rdk::common::{
    config::{OutputDialect, ServiceConfig, DEFAULT_AUXILIARY_CONFIG_DIR, DEFAULT_TIMEOUT},
    handler::{router, DetectionService},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve grasp pose detection over HTTP, running the external detector once
/// per uploaded point cloud
#[derive(Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the grasp detection executable
    #[arg(long, env = "GRASP_EXECUTABLE", default_value = "./detect_grasps")]
    executable: PathBuf,
    /// Primary configuration file handed to the detector
    #[arg(
        long = "config",
        env = "GRASP_CONFIG",
        default_value = "./cfg/eigen_params.cfg"
    )]
    primary_config: PathBuf,
    /// Auxiliary configuration files the detector looks up next to itself.
    /// Copied into --aux-config-dir on first use if missing there
    #[arg(long = "aux-config", env = "GRASP_AUX_CONFIGS", value_delimiter = ',')]
    auxiliary_configs: Vec<PathBuf>,
    /// Directory for auxiliary configs, relative to the executable's directory
    #[arg(long = "aux-config-dir", env = "GRASP_AUX_CONFIG_DIR", default_value = DEFAULT_AUXILIARY_CONFIG_DIR)]
    auxiliary_config_dir: PathBuf,
    /// Scratch directory for uploaded clouds and the visualization snapshot.
    /// Defaults to a grasp-rdk directory under the system temp dir
    #[arg(long, env = "GRASP_WORKSPACE")]
    workspace: Option<PathBuf>,
    /// Seconds a detector run may take before it is killed
    #[arg(long = "timeout-secs", env = "GRASP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,
    /// Output format of the detector build: structured or textual-log
    #[arg(long, env = "GRASP_DIALECT", default_value_t = OutputDialect::Structured)]
    dialect: OutputDialect,
    #[arg(long, env = "GRASP_BIND", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
    /// Refuse to start when the detector or its configs are missing instead of
    /// reporting the problem per request
    #[arg(long = "strict-startup")]
    strict_startup: bool,
}

impl Cli {
    fn service_config(&self) -> ServiceConfig {
        let config = ServiceConfig::new(&self.executable, &self.primary_config)
            .with_auxiliary_configs(self.auxiliary_configs.clone())
            .with_auxiliary_config_dir(&self.auxiliary_config_dir)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_dialect(self.dialect);
        match &self.workspace {
            Some(workspace) => config.with_workspace_dir(workspace),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=debug,grasp_rdk=debug,tower_http=debug",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let service = DetectionService::new(cli.service_config());
    tracing::info!(
        executable = %service.config().executable_path().display(),
        config = %service.config().primary_config_path().display(),
        workspace = %service.config().workspace_dir().display(),
        dialect = %service.config().dialect(),
        timeout_secs = cli.timeout_secs,
        "grasp detection service configured"
    );
    match service.validate() {
        Ok(()) => tracing::info!("detector prerequisites present"),
        Err(err) if cli.strict_startup => return Err(err.into()),
        Err(err) => tracing::warn!("{err}, requests will fail until this is fixed"),
    }
    if service.config().dialect() == OutputDialect::TextualLog {
        tracing::warn!("textual-log dialect: returned poses and widths are placeholders");
    }

    let app = router(Arc::new(service)).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!("serving grasp detection on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
