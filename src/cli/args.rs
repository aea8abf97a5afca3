use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "edenfs")]
#[command(about = "Inspect and recover EdenFS overlay directories")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

/// Which overlay to operate on: an explicit directory or a named checkout
/// under the state directory.
#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct OverlayTarget {
    #[arg(help = "Overlay directory")]
    pub overlay_dir: Option<String>,

    #[arg(long, help = "Checkout name, resolved under EDENFS_STATE_DIR")]
    pub client: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Check an overlay for damage and repair it")]
    Fsck {
        #[command(flatten)]
        target: OverlayTarget,

        #[arg(long, help = "Report problems without changing anything")]
        dry_run: bool,

        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Print the tree stored in an overlay")]
    Show {
        #[command(flatten)]
        target: OverlayTarget,
    },
}

impl OverlayTarget {
    pub fn resolve(&self) -> edenfs::Result<PathBuf> {
        match (&self.overlay_dir, &self.client) {
            (Some(dir), _) => Ok(edenfs::config::expand_tilde(dir)),
            (None, Some(name)) => edenfs::config::default_overlay_dir(name),
            (None, None) => Err(edenfs::EdenError::Config(
                "an overlay directory or --client is required".to_string(),
            )),
        }
    }
}
