//! Operator tool for the shared-memory kill switch.
//!
//! ```text
//! killswitch --name flash_kill init
//! killswitch --name flash_kill engage
//! killswitch --name flash_kill status
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flash_feed::shm::shm_path;
use flash_feed::KillSwitch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "killswitch", about = "Inspect or flip the pipeline kill switch")]
struct Cli {
    /// Region name under /dev/shm
    #[arg(long, conflicts_with = "path")]
    name: Option<String>,
    /// Explicit region path
    #[arg(long)]
    path: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create (or truncate) the region in the released state
    Init,
    /// Reject every order from now on
    Engage,
    /// Release the switch
    Reset,
    /// Print the current state
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = match (cli.path, cli.name) {
        (Some(path), _) => path,
        (None, Some(name)) => shm_path(&name),
        (None, None) => bail!("one of --name or --path is required"),
    };

    let open = || KillSwitch::open(&path).with_context(|| format!("opening {}", path.display()));
    match cli.command {
        Cmd::Init => {
            KillSwitch::create(&path, false).with_context(|| format!("creating {}", path.display()))?;
            println!("{}: released", path.display());
        }
        Cmd::Engage => {
            let switch = open()?;
            if switch.engage() {
                println!("{}: engaged", path.display());
            } else {
                println!("{}: already engaged", path.display());
            }
        }
        Cmd::Reset => {
            open()?.reset();
            println!("{}: released", path.display());
        }
        Cmd::Status => {
            let switch = open()?;
            let state = if switch.is_engaged() { "engaged" } else { "released" };
            println!("{}: {state} (word {:#x})", path.display(), switch.state_word());
        }
    }
    Ok(())
}
