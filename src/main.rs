use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

mod adb;
mod apk;
mod error;
mod install;
mod keys;
mod packet;
mod sync;
mod transport;
mod util;

use crate::adb::AdbSession;
use crate::keys::AdbKey;
use crate::transport::Transport;
use crate::util::config;
use crate::util::logging;

#[derive(Debug, Parser)]
#[command(name = "apkbeam", version, about = "Sideload APKs onto Android TV boxes over network ADB")]
struct Cli {
    /// Device address as host[:port]; falls back to the saved default
    #[arg(long, short = 'd', global = true)]
    device: Option<String>,

    /// Directory (or file) holding the adbkey pair
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    /// TCP connect timeout in seconds
    #[arg(long, default_value_t = transport::DEFAULT_CONNECT_TIMEOUT.as_secs(), global = true)]
    connect_timeout: u64,

    /// Verbose logging (-v for protocol events, -vv for packet dumps)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload an APK and install it with pm install -r
    Install { apk: PathBuf },
    /// Push a local file to a device path
    Push { local: PathBuf, remote: String },
    /// Run a shell command on the device and print its output
    Shell {
        #[arg(required = true)]
        command: Vec<String>,
    },
    /// Reboot the device
    Reboot,
    /// Extract the launcher icon from a local APK
    Icon {
        apk: PathBuf,
        /// Output file (default: the APK path with a .png extension)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Persistently save a default device address
    SetDevice { address: String },
    /// Forget the saved default device address
    ClearDevice,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let mut state = config::load_state();

    // Commands that never touch a device are handled before connecting.
    match &cli.command {
        Commands::SetDevice { address } => {
            transport::parse_endpoint(address).context("Checking device address")?;
            state.device = Some(address.clone());
            config::save_state(&state).context("Saving state")?;
            println!("Default device set to {}", address);
            return Ok(());
        }
        Commands::ClearDevice => {
            state.device = None;
            config::save_state(&state).context("Saving state")?;
            println!("Default device cleared.");
            return Ok(());
        }
        Commands::Icon { apk, output } => {
            let icon = apk::extract_icon(apk)
                .with_context(|| format!("Reading {}", apk.display()))?;
            let Some(bytes) = icon else {
                bail!("No launcher icon found in {}", apk.display());
            };
            let out = output.clone().unwrap_or_else(|| apk.with_extension("png"));
            fs::write(&out, &bytes).with_context(|| format!("Writing {}", out.display()))?;
            println!("Icon written to {} ({} bytes)", out.display(), bytes.len());
            return Ok(());
        }
        _ => {}
    }

    let address = match cli.device.clone().or_else(|| state.device.clone()) {
        Some(address) => address,
        None => bail!("No device address. Pass --device host[:port] or run `apkbeam set-device`."),
    };
    let (host, port) = transport::parse_endpoint(&address).context("Parsing device address")?;
    let key_dir = cli.key_dir.clone().unwrap_or_else(config::default_key_dir);
    let key = AdbKey::load_or_create(&key_dir).context("Loading ADB key")?;

    let timeout = Duration::from_secs(cli.connect_timeout);
    let transport = Transport::connect(&host, port, timeout)
        .with_context(|| format!("Connecting to {host}:{port}"))?;
    let mut session = AdbSession::connect(transport, &key).context("ADB handshake failed")?;

    match cli.command {
        Commands::Install { apk } => {
            if !apk.exists() {
                bail!("APK not found: {}", apk.display());
            }
            let mut print_line = |msg: &str| println!("{msg}");
            install::install_apk(&mut session, &apk, &mut print_line)
                .context("Install failed")?;
        }
        Commands::Push { local, remote } => {
            let total = fs::metadata(&local)
                .with_context(|| format!("Reading {}", local.display()))?
                .len();
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%)")
                    .unwrap()
                    .progress_chars("=>-"),
            );
            let mut stream = session.open("sync:").context("Opening sync service")?;
            sync::push_file(&mut stream, &local, &remote, &mut |sent, _| pb.set_position(sent))
                .with_context(|| format!("Pushing {}", local.display()))?;
            stream.close()?;
            pb.finish_and_clear();
            println!("Pushed {} to {}", local.display(), remote);
        }
        Commands::Shell { command } => {
            let output = session.run_shell(&command.join(" ")).context("Running shell command")?;
            print!("{output}");
        }
        Commands::Reboot => {
            session.simple_command("reboot:").context("reboot:")?;
            println!("Reboot requested.");
        }
        Commands::Icon { .. } | Commands::SetDevice { .. } | Commands::ClearDevice => {
            // handled before connecting
        }
    }

    Ok(())
}
