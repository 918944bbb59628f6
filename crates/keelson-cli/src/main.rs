//! Keelson CLI - deploy pre-rendered Kubernetes manifests as tracked releases

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod backend;
mod commands;
mod display;
mod error;
mod exit_codes;

#[derive(Parser)]
#[command(name = "keelson")]
#[command(author = "Keelson Contributors")]
#[command(version)]
#[command(about = "Deploy pre-rendered Kubernetes manifests as tracked, locked releases", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Release namespace
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    /// Release storage driver (secrets, configmap, file, memory)
    #[arg(long, global = true, default_value = "secrets", env = "KEELSON_STORAGE")]
    storage: String,

    /// Deploy settings file (YAML)
    #[arg(long, global = true, env = "KEELSON_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a manifest as the next revision of a release
    Deploy {
        /// Release name
        release: String,

        /// Manifest file (multi-document YAML)
        #[arg(short = 'f', long = "manifest")]
        manifest: PathBuf,

        /// CRD manifest, applied before everything else
        #[arg(long)]
        crds: Option<PathBuf>,

        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what a deploy would do without changing anything
    Plan {
        /// Release name
        release: String,

        /// Manifest file (multi-document YAML)
        #[arg(short = 'f', long = "manifest")]
        manifest: PathBuf,

        /// CRD manifest
        #[arg(long)]
        crds: Option<PathBuf>,

        /// Output the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Redeploy the resources of an earlier revision
    Rollback {
        /// Release name
        release: String,

        /// Revision to restore (default: last deployed before the current one)
        revision: Option<u32>,
    },

    /// Show release history
    History {
        /// Release name
        release: String,

        /// Show only the latest revisions
        #[arg(long)]
        max: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the latest revision of a release
    Status {
        /// Release name
        release: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug {
            "keelson=debug,keelson_kube=debug"
        } else {
            "warn"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    let global = commands::Global {
        namespace: cli.namespace,
        storage: cli.storage,
        config: cli.config,
    };

    let result = match cli.command {
        Commands::Deploy {
            release,
            manifest,
            crds,
            json,
        } => commands::deploy::run(&global, &release, &manifest, crds.as_deref(), json).await,

        Commands::Plan {
            release,
            manifest,
            crds,
            json,
        } => commands::plan::run(&global, &release, &manifest, crds.as_deref(), json).await,

        Commands::Rollback { release, revision } => {
            commands::rollback::run(&global, &release, revision).await
        }

        Commands::History { release, max, json } => {
            commands::history::run(&global, &release, max, json).await
        }

        Commands::Status { release, json } => commands::status::run(&global, &release, json).await,
    };

    if let Err(err) = result {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
