use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "steer",
    about = "steer — load-balancer control plane tooling",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a checkpoint's bound socket address before restoring it on
    /// another host.
    ///
    /// Sockets bound to OLD_ADDR or to a wildcard address are rebound to
    /// NEW_ADDR. With IMAGE_NAME, image ids in the container metadata are
    /// replaced so the target host can resolve the image by name.
    Patch {
        /// Checkpoint directory or .tar archive
        archive: PathBuf,
        old_addr: String,
        new_addr: String,
        image_name: Option<String>,
        /// Where to dump the decoded socket image if no socket matches
        #[arg(long)]
        dump_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("steer=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Patch {
            archive,
            old_addr,
            new_addr,
            image_name,
            dump_dir,
        } => commands::patch::patch(&archive, &old_addr, &new_addr, image_name.as_deref(), dump_dir),
    }
}
