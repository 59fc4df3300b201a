//! Starts a throwaway control plane and keeps it running until Ctrl-C.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use kube_testenv::{DatastoreKind, Environment, Settings};
use tempfile::NamedTempFile;

#[derive(Debug, Parser)]
#[command(about = "Run a kube-apiserver and datastore for poking at by hand")]
struct Args {
    /// Attach to the apiserver and datastore output; a shortcut for
    /// KUBEBUILDER_ATTACH_CONTROL_PLANE_OUTPUT=true
    #[arg(long)]
    debug_env: bool,

    /// Datastore backend (etcd or kine), overriding TEST_DATASTORE
    #[arg(long)]
    datastore: Option<DatastoreKind>,

    /// Write the admin kubeconfig here instead of a temporary file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

/// Where the admin kubeconfig ended up. A temporary file is removed on drop.
enum KubeconfigFile {
    Temporary(NamedTempFile),
    Fixed(PathBuf),
}

impl KubeconfigFile {
    fn path(&self) -> &Path {
        match self {
            Self::Temporary(file) => file.path(),
            Self::Fixed(path) => path,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings::global().clone();
    if args.debug_env {
        settings.attach_output = true;
    }
    if let Some(kind) = args.datastore {
        settings.datastore = kind;
    }
    let mut env = Environment::with_settings(settings);

    log::info!("starting apiserver & {:?}", env.control_plane.datastore.kind());
    let config = match env.start().await {
        Ok(config) => config,
        Err(err) => {
            log::error!("unable to start the test environment: {err}");
            // whatever did come up still has to go
            if let Err(err) = env.stop().await {
                log::error!("unable to stop the test environment after an error: {err}");
            }
            return ExitCode::FAILURE;
        }
    };
    log::info!("apiserver running at {}", config.cluster_url);

    let _kubeconfig = match write_kubeconfig(&env, args.kubeconfig) {
        Ok(file) => {
            log::info!("wrote kubeconfig to {}", file.path().display());
            Some(file)
        }
        Err(err) => {
            log::error!("unable to write the admin kubeconfig, continuing without it: {err}");
            None
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("unable to listen for Ctrl-C, shutting down: {err}");
    }

    log::info!("shutting down apiserver & {:?}", env.control_plane.datastore.kind());
    if let Err(err) = env.stop().await {
        log::error!("unable to stop the test environment: {err}");
        return ExitCode::FAILURE;
    }
    log::info!("shutdown successful");
    ExitCode::SUCCESS
}

fn write_kubeconfig(
    env: &Environment,
    fixed: Option<PathBuf>,
) -> Result<KubeconfigFile, Box<dyn std::error::Error>> {
    let kubeconfig = env.admin()?.kubeconfig()?;

    match fixed {
        Some(path) => {
            std::fs::write(&path, &kubeconfig)?;
            Ok(KubeconfigFile::Fixed(path))
        }
        None => {
            let mut file = tempfile::Builder::new()
                .prefix("scratch-env-kubeconfig-")
                .tempfile()?;
            file.write_all(&kubeconfig)?;
            file.flush()?;
            Ok(KubeconfigFile::Temporary(file))
        }
    }
}
