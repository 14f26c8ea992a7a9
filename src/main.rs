//! switchcon - emulate a Nintendo Switch controller over Bluetooth.
//!
//! Presents the local adapter as a Pro Controller or Joy-Con, completes the
//! console's pairing handshake, and keeps the input report stream running
//! while an interactive shell drives buttons, sticks and the NFC reader.

mod bt;
mod cli;
mod controller;
mod flash;
mod mcu;
mod nfc;
mod report;
mod state;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use bt::protocol::ControllerProtocol;
use bt::server::{self, ServerConfig};
use cli::ControllerCli;
use controller::ControllerKind;
use flash::FlashMemory;
use nfc::NfcTag;

#[derive(Parser)]
#[command(
    name = "switchcon",
    about = "Emulate a Nintendo Switch controller over Bluetooth"
)]
struct Args {
    /// Controller to emulate: PRO_CONTROLLER, JOYCON_L or JOYCON_R
    #[arg(value_parser = ControllerKind::from_str)]
    controller: ControllerKind,

    /// Skip pairing and reconnect to an already paired console address
    #[arg(short, long)]
    reconnect: Option<String>,

    /// 512 KiB SPI flash image to serve reads from
    #[arg(long)]
    spi_flash: Option<PathBuf>,

    /// Amiibo dump to present on the NFC reader
    #[arg(long)]
    nfc: Option<PathBuf>,

    /// Record every sent and received report to this file
    #[arg(long)]
    capture: Option<PathBuf>,

    /// HID SDP record XML overriding the embedded one
    #[arg(long)]
    sdp_record: Option<PathBuf>,

    /// Bluetooth adapter to use
    #[arg(long, default_value = "hci0")]
    device_id: String,

    /// In-flight packet credits for interrupt channel writes
    #[arg(long, default_value_t = 4)]
    flow_control: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let flash = match &args.spi_flash {
        Some(path) => FlashMemory::from_file(path)
            .with_context(|| format!("loading SPI flash image {}", path.display()))?,
        None => FlashMemory::new(),
    };

    let reconnect = args
        .reconnect
        .as_deref()
        .map(bluer::Address::from_str)
        .transpose()
        .context("invalid console address")?;

    let protocol = ControllerProtocol::new(args.controller, flash, reconnect.is_some());
    let state = protocol.controller_state();

    if let Some(path) = &args.nfc {
        let tag = NfcTag::load_amiibo(path)
            .with_context(|| format!("loading amiibo {}", path.display()))?;
        info!("[NFC] presenting amiibo {} (uid {:02X?})", path.display(), tag.uid());
        state.set_nfc(Some(tag));
    }

    let config = ServerConfig {
        device_id: args.device_id.clone(),
        reconnect,
        capture: args.capture.clone(),
        flow_control: args.flow_control,
        sdp_record: args.sdp_record.clone(),
    };
    let transport = server::create_hid_server(&protocol, &config).await?;

    info!("waiting for the console to finish configuring the controller...");
    if state.connect().await.is_err() {
        warn!("connection lost before the console accepted input");
        transport.close().await;
        return Ok(());
    }
    info!("console connected; type \"help\" for commands");

    let shell = ControllerCli::new(state);
    let result = shell.run().await;

    transport.close().await;
    result
}
