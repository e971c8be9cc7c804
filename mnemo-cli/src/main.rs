mod logger;

use std::path::PathBuf;

use clap::Parser;
use kube::config::KubeConfigOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mnemo_core::cluster::KubeDynamicCluster;
use mnemo_core::crypto::TransformerMap;
use mnemo_core::restore::{restore_from_archive, restore_from_dir, RestoreSummary};

pub type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "mnemo")]
#[command(about = "Replay a backup archive into a Kubernetes cluster", long_about = None)]
struct Cli {
    /// Backup tarball (<name>.tar.gz) to restore.
    #[arg(long, env = "MNEMO_ARCHIVE", conflicts_with = "dir")]
    archive: Option<PathBuf>,
    /// Already-extracted archive directory to restore.
    #[arg(long, env = "MNEMO_ARCHIVE_DIR")]
    dir: Option<PathBuf>,
    #[arg(long, env = "KUBE_CONTEXT")]
    kube_context: Option<String>,
    /// Name of the encryption configuration object in namespace `default`.
    #[arg(long, env = "MNEMO_ENCRYPTION_CONFIG")]
    encryption_config: Option<String>,
    #[arg(long, env = "MNEMO_LOG_LEVEL", default_value = "INFO")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    logger::setup(&cli.log_level);

    let options = KubeConfigOptions {
        context: cli.kube_context.clone(),
        ..Default::default()
    };
    let cluster = KubeDynamicCluster::new(&options).await?;

    let transformers = match cli.encryption_config.as_deref() {
        Some(name) => TransformerMap::from_cluster(&cluster, name).await?,
        None => TransformerMap::default(),
    };

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling the restore");
            signal_token.cancel();
        }
    });

    let summary: RestoreSummary = match (&cli.archive, &cli.dir) {
        (Some(archive), None) => {
            restore_from_archive(archive, &cluster, &transformers, &token).await?
        }
        (None, Some(dir)) => restore_from_dir(dir, &cluster, &transformers, &token).await?,
        _ => {
            error!("Exactly one of --archive or --dir is required");
            std::process::exit(2);
        }
    };

    info!(
        "Restore finished: {} definition(s), {} object(s) applied",
        summary.definitions, summary.applied
    );
    if let Some(err) = summary.into_error() {
        error!("{err}");
        std::process::exit(1);
    }
    Ok(())
}
