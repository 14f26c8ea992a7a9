//! HID server bootstrap.
//!
//! Initial pairing dresses the local adapter up as the emulated controller
//! (name, gamepad class, SDP record, discoverable/pairable), listens on the
//! HID PSMs and accepts the console's two channels. Reconnection dials a
//! previously paired console directly. Either way the session ends up with a
//! running [`L2capTransport`] wired to the protocol engine.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bluer::l2cap::{SeqPacket, SeqPacketListener, SocketAddr};
use bluer::{Address, AddressType};
use tokio::time::sleep;
use tracing::{info, warn};

use super::adapter::HidAdapter;
use super::protocol::ControllerProtocol;
use super::transport::L2capTransport;
use crate::report::InputReport;

/// HID control channel PSM.
pub const PSM_CONTROL: u16 = 17;
/// HID interrupt channel PSM.
pub const PSM_INTERRUPT: u16 = 19;

/// HID SDP record shipped with the binary; `--sdp-record` overrides it.
const DEFAULT_SDP_RECORD: &str = include_str!("../../profile/sdp_record_hid.xml");

pub struct ServerConfig {
    pub device_id: String,
    /// Console address to reconnect to; `None` runs the pairing flow.
    pub reconnect: Option<Address>,
    pub capture: Option<PathBuf>,
    pub flow_control: usize,
    pub sdp_record: Option<PathBuf>,
}

/// Brings up the session and returns the running transport.
pub async fn create_hid_server(
    protocol: &Arc<ControllerProtocol>,
    config: &ServerConfig,
) -> anyhow::Result<Arc<L2capTransport>> {
    let (ctl, itr) = match config.reconnect {
        Some(address) => connect_to_console(address).await?,
        None => accept_from_console(protocol, config).await?,
    };

    let capture = match &config.capture {
        Some(path) => Some(
            std::fs::File::create(path)
                .with_context(|| format!("creating capture file {}", path.display()))?,
        ),
        None => None,
    };

    let transport = L2capTransport::new(itr, ctl, config.flow_control, capture)
        .context("setting up the L2CAP transport")?;
    transport.start(protocol.clone());
    protocol.connection_made(transport.clone());
    info!("[BT] session established with {}", transport.peer_address());

    if config.reconnect.is_none() {
        send_empty_reports_until_reply(protocol, &transport).await;
    }

    Ok(transport)
}

/// The console only starts its side of the handshake after seeing input
/// reports: poke it with the pre-pairing report once a second until the
/// first output report arrives.
async fn send_empty_reports_until_reply(
    protocol: &Arc<ControllerProtocol>,
    transport: &Arc<L2capTransport>,
) {
    let mut report = InputReport::new();
    report.set_report_id(0x3F);
    report.set_simple_report_constants();
    let Ok(bytes) = report.as_bytes().map(<[u8]>::to_vec) else {
        return;
    };

    let sender = tokio::spawn({
        let transport = transport.clone();
        async move {
            loop {
                if transport.write(&bytes).await.is_err() {
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
        }
    });
    protocol.wait_for_output_report().await;
    sender.abort();
    let _ = sender.await;
}

async fn accept_from_console(
    protocol: &Arc<ControllerProtocol>,
    config: &ServerConfig,
) -> anyhow::Result<(SeqPacket, SeqPacket)> {
    let connection = zbus::Connection::system()
        .await
        .context("connecting to the system D-Bus")?;
    let adapter = HidAdapter::new(&connection, &config.device_id).await?;

    adapter.set_name(protocol.kind().device_name()).await?;
    adapter.set_class().await?;
    let record = match &config.sdp_record {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading SDP record {}", path.display()))?,
        None => DEFAULT_SDP_RECORD.to_string(),
    };
    adapter.register_sdp_record(&record).await?;
    adapter.set_powered(true).await?;
    adapter.set_pairable(true).await?;
    adapter.set_discoverable(true).await?;

    let local = adapter.address().await?;
    let (ctl_listener, itr_listener) = bind_listeners(local).await?;

    info!("[BT] waiting for the console to connect...");
    info!("[BT] >> open the 'Change Grip/Order' menu on the console <<");

    let (ctl, ctl_peer) = ctl_listener
        .accept()
        .await
        .context("accepting the control channel")?;
    info!("[BT] accepted connection at psm {PSM_CONTROL} from {}", ctl_peer.addr);
    let (itr, itr_peer) = itr_listener
        .accept()
        .await
        .context("accepting the interrupt channel")?;
    info!("[BT] accepted connection at psm {PSM_INTERRUPT} from {}", itr_peer.addr);

    if ctl_peer.addr != itr_peer.addr {
        bail!(
            "control and interrupt peers differ ({} vs {})",
            ctl_peer.addr,
            itr_peer.addr
        );
    }

    // stop advertising once the console is on both channels
    adapter.set_pairable(false).await?;
    adapter.set_discoverable(false).await?;

    Ok((ctl, itr))
}

async fn connect_to_console(address: Address) -> anyhow::Result<(SeqPacket, SeqPacket)> {
    info!("[BT] reconnecting to console {address}");
    let ctl = SeqPacket::connect(SocketAddr::new(address, AddressType::BrEdr, PSM_CONTROL))
        .await
        .context("connecting the control channel")?;
    let itr = SeqPacket::connect(SocketAddr::new(address, AddressType::BrEdr, PSM_INTERRUPT))
        .await
        .context("connecting the interrupt channel")?;
    Ok((ctl, itr))
}

async fn bind_listeners(
    local: Address,
) -> anyhow::Result<(SeqPacketListener, SeqPacketListener)> {
    match try_bind(local).await {
        Ok(listeners) => Ok(listeners),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            warn!("[BT] HID PSMs busy; restarting bluetooth and rebinding to any address");
            restart_bluetooth_service().await;
            try_bind(Address::any())
                .await
                .context("rebinding after bluetooth restart")
        }
        Err(err) => Err(err).context("binding the L2CAP PSMs"),
    }
}

async fn try_bind(address: Address) -> io::Result<(SeqPacketListener, SeqPacketListener)> {
    let ctl =
        SeqPacketListener::bind(SocketAddr::new(address, AddressType::BrEdr, PSM_CONTROL)).await?;
    let itr =
        SeqPacketListener::bind(SocketAddr::new(address, AddressType::BrEdr, PSM_INTERRUPT))
            .await?;
    Ok((ctl, itr))
}

async fn restart_bluetooth_service() {
    info!("[BT] restarting bluetooth service...");
    let _ = tokio::process::Command::new("systemctl")
        .args(["restart", "bluetooth.service"])
        .output()
        .await;
    sleep(Duration::from_secs(1)).await;
}
