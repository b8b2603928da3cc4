use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::{Args, Parser};
use grasp_rdk::common::{
    client::{ClientConfig, GraspClient},
    config::{DetectionParams, DEFAULT_N_BEST, DEFAULT_ROTATION_RESOLUTION, DEFAULT_TOP_N},
    point_cloud::PointCloud,
};
use tokio::runtime::Runtime;

/// Ask a grasp detection server for grasps on an item resting in a scene
#[derive(Parser)]
#[command(about, version)]
struct Cli {
    /// ASCII PCD file holding the item to grasp
    #[arg(long, requires = "env", conflicts_with = "demo")]
    item: Option<PathBuf>,
    /// ASCII PCD file holding the rest of the scene
    #[arg(long, requires = "item")]
    env: Option<PathBuf>,
    /// Use a generated cube-on-a-table scene instead of files
    #[arg(long)]
    demo: bool,
    #[command(flatten)]
    server: ServerArgs,
    /// Number of rotation samples the detector evaluates
    #[arg(long, default_value_t = DEFAULT_ROTATION_RESOLUTION)]
    rotation_resolution: u32,
    /// Number of top grasps kept before clustering
    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    top_n: u32,
    /// Number of grasps returned
    #[arg(long, default_value_t = DEFAULT_N_BEST)]
    n_best: u32,
    /// Ask the server to render a visualization snapshot
    #[arg(long)]
    enable_visualization: bool,
}

#[derive(Args)]
struct ServerArgs {
    /// Application config JSON with a servers.graspnet.{ip,port} entry
    #[arg(long = "app-config", env = "GRASP_APP_CONFIG")]
    app_config: Option<PathBuf>,
    /// Overrides the server address from the application config
    #[arg(long, env = "GRASP_SERVER_IP")]
    server_ip: Option<String>,
    #[arg(long, env = "GRASP_SERVER_PORT")]
    server_port: Option<u16>,
    /// Seconds to wait for the server's answer
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,
}

impl ServerArgs {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.app_config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                let document = serde_json::from_str(&text)
                    .with_context(|| format!("{} is not valid JSON", path.display()))?;
                ClientConfig::from_json(&document)
            }
            None => ClientConfig::default(),
        };
        if let Some(ip) = &self.server_ip {
            config.server_ip.clone_from(ip);
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

impl Cli {
    fn scene(&self) -> anyhow::Result<(PointCloud, PointCloud)> {
        match (&self.item, &self.env) {
            (Some(item), Some(env)) => Ok((read_cloud(item)?, read_cloud(env)?)),
            _ if self.demo => Ok(PointCloud::demo_scene()),
            _ => anyhow::bail!("either --item and --env or --demo is required"),
        }
    }

    fn params(&self) -> DetectionParams {
        DetectionParams {
            rotation_resolution: self.rotation_resolution,
            top_n: self.top_n,
            n_best: self.n_best,
            visualization_enabled: self.enable_visualization,
        }
    }
}

fn read_cloud(path: &Path) -> anyhow::Result<PointCloud> {
    let text =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    PointCloud::from_pcd(&text).with_context(|| format!("cannot parse {}", path.display()))
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();
    let (item, env) = cli.scene()?;
    let config = cli.server.client_config()?;
    log::info!(
        "requesting grasps from {} for {} item points and {} scene points",
        config.base_url(),
        item.len(),
        env.len()
    );
    let client = GraspClient::new(config)?;

    let rt = Runtime::new()?;
    let grasps = rt.block_on(client.predict(&item, &env, &cli.params()))?;

    for (i, grasp) in grasps.candidates().iter().enumerate() {
        let t = grasp.translation();
        println!(
            "grasp {}: position [{:.4}, {:.4}, {:.4}] width {:.4} score {:.3}",
            i + 1,
            t.x,
            t.y,
            t.z,
            grasp.width(),
            grasp.score()
        );
    }
    if let Some(url) = grasps.visualization_url() {
        println!("visualization: {}{url}", client.config().base_url());
    }
    println!("{}", serde_json::to_string_pretty(&grasps.best().to_json())?);
    Ok(())
}
