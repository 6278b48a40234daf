//! cidata-iso - builds cloud-init NoCloud and ConfigDrive images for VMs
//!
//! A thin wrapper over the library: reads a VM description from YAML,
//! resolves its cloud-init payload and publishes the image.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cidata_iso::{
    DataSourceKind, GeneratorConfig, IsoGenerator, SecretResolver, VirtualMachine,
    generate_for_vm,
};

#[derive(Parser)]
#[command(name = "cidata-iso")]
#[command(author, version, about = "Build cloud-init VM images", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML configuration file
    #[arg(short, long, env = "CIDATA_ISO_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Root of the generated media tree
    #[arg(long, env = "CIDATA_ISO_LOCAL_DIR", global = true)]
    local_dir: Option<PathBuf>,

    /// Root of the mounted secrets
    #[arg(long, env = "CIDATA_ISO_SECRET_DIR", global = true)]
    secret_dir: Option<PathBuf>,

    /// Mastering tool timeout in seconds
    #[arg(long, env = "CIDATA_ISO_TIMEOUT", global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the VM's cloud-init payload and publish its image
    Generate {
        /// VM description (YAML)
        #[arg(long)]
        vm: PathBuf,
    },
    /// Publish a zero-filled placeholder image
    Empty {
        /// VM description (YAML)
        #[arg(long)]
        vm: PathBuf,
        /// Data source kind (no-cloud, config-drive)
        #[arg(long)]
        kind: DataSourceKind,
        /// Image size in bytes
        #[arg(long)]
        size: u64,
    },
    /// Print the paths used for a VM
    Paths {
        /// VM description (YAML)
        #[arg(long)]
        vm: PathBuf,
    },
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn load_config(cli: &Cli) -> Result<GeneratorConfig> {
    let mut config = match &cli.config {
        Some(path) => GeneratorConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => GeneratorConfig::default(),
    };

    if let Some(local_dir) = &cli.local_dir {
        config.local_dir = local_dir.clone();
    }
    if let Some(secret_dir) = &cli.secret_dir {
        config.secret_dir = secret_dir.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.iso_timeout_secs = timeout;
    }
    config.validate()?;
    Ok(config)
}

async fn load_vm(path: &Path) -> Result<VirtualMachine> {
    VirtualMachine::load(path)
        .await
        .with_context(|| format!("loading VM description {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = load_config(&cli).await?;
    let generator = IsoGenerator::from_config(&config).await?;

    match &cli.command {
        Commands::Generate { vm } => {
            let mut vm = load_vm(vm).await?;
            let secrets = SecretResolver::new(&config.secret_dir);
            match generate_for_vm(&generator, &secrets, &mut vm).await {
                Ok(Some(kind)) => {
                    let image = generator
                        .local_dir()
                        .image_path(kind, &vm.name, &vm.namespace);
                    println!("{}", image.display());
                }
                Ok(None) => info!("Nothing to generate"),
                Err(e) if e.is_missing_data_source() => {
                    warn!("Nothing to generate: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Empty { vm, kind, size } => {
            let vm = load_vm(vm).await?;
            generator
                .generate_empty(&vm.name, &vm.namespace, *kind, *size)
                .await?;
            let image = generator
                .local_dir()
                .image_path(*kind, &vm.name, &vm.namespace);
            println!("{}", image.display());
        }
        Commands::Paths { vm } => {
            let vm = load_vm(vm).await?;
            let local_dir = generator.local_dir();
            println!(
                "domain_dir: {}",
                local_dir.domain_dir(&vm.name, &vm.namespace).display()
            );
            println!(
                "instance_id: {}",
                local_dir.instance_id_file(&vm.name, &vm.namespace).display()
            );
            for kind in [DataSourceKind::NoCloud, DataSourceKind::ConfigDrive] {
                let paths = local_dir.artifact_paths(kind, &vm.name, &vm.namespace);
                println!("{}.image: {}", kind, paths.image.display());
                println!("{}.staging: {}", kind, paths.staging.display());
                println!("{}.data: {}", kind, paths.data_dir.display());
            }
        }
    }

    Ok(())
}
