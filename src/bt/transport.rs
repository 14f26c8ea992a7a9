//! L2CAP transport carrying the HID report stream.
//!
//! Owns the control (PSM 17) and interrupt (PSM 19) SEQPACKET sockets. The
//! control channel stays open for the session but is unused after
//! acceptance; all reports travel over the interrupt channel. A reader task
//! feeds received output reports to the protocol engine. Writes are gated by
//! two link-level signals observed on raw HCI sockets: a bounded in-flight
//! packet window (Number Of Completed Packets events return credits) and a
//! pause while the link degrades (Max Slots Change below 5).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bluer::l2cap::SeqPacket;
use bluer::Address;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::hci::{HciEventSocket, EVT_MAX_SLOTS_CHANGE, EVT_NUM_COMP_PKTS};
use super::protocol::ControllerProtocol;

/// Output reports from the console fit in 50 bytes.
const READ_BUFFER_SIZE: usize = 50;

/// Back-off while the link runs with reduced slots.
const LINK_DEGRADED_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("not connected")]
pub struct NotConnectedError;

/// Bounded window of in-flight interrupt packets. The HCI monitor returns
/// credits as the controller confirms completed packets; surplus credits are
/// discarded.
pub(crate) struct FlowWindow {
    sem: Semaphore,
    limit: usize,
}

impl FlowWindow {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            sem: Semaphore::new(limit),
            limit,
        }
    }

    pub(crate) async fn acquire(&self) -> Result<(), NotConnectedError> {
        let permit = self.sem.acquire().await.map_err(|_| NotConnectedError)?;
        permit.forget();
        Ok(())
    }

    pub(crate) fn release(&self, count: usize) {
        let headroom = self.limit.saturating_sub(self.sem.available_permits());
        self.sem.add_permits(count.min(headroom));
    }

    pub(crate) fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub(crate) fn close(&self) {
        self.sem.close();
    }
}

pub struct L2capTransport {
    itr: Mutex<Option<Arc<SeqPacket>>>,
    ctr: Mutex<Option<Arc<SeqPacket>>>,
    local_address: Address,
    peer_address: Address,
    write_window: FlowWindow,
    /// Serializes the whole write path so socket order equals call order.
    write_serial: tokio::sync::Mutex<()>,
    writing_allowed: watch::Sender<bool>,
    reading_allowed: watch::Sender<bool>,
    closing: AtomicBool,
    protocol: Mutex<Option<Arc<ControllerProtocol>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    capture: Option<Mutex<std::fs::File>>,
}

impl L2capTransport {
    pub fn new(
        itr: SeqPacket,
        ctr: SeqPacket,
        flow_control: usize,
        capture: Option<std::fs::File>,
    ) -> std::io::Result<Arc<Self>> {
        let local_address = AsRef::<bluer::l2cap::Socket<SeqPacket>>::as_ref(&itr).local_addr()?.addr;
        let peer_address = itr.peer_addr()?.addr;
        Ok(Arc::new(Self {
            itr: Mutex::new(Some(Arc::new(itr))),
            ctr: Mutex::new(Some(Arc::new(ctr))),
            local_address,
            peer_address,
            write_window: FlowWindow::new(flow_control),
            write_serial: tokio::sync::Mutex::new(()),
            writing_allowed: watch::channel(true).0,
            reading_allowed: watch::channel(true).0,
            closing: AtomicBool::new(false),
            protocol: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            capture: capture.map(Mutex::new),
        }))
    }

    /// Spawns the reader and both HCI monitors, feeding `protocol`.
    pub fn start(self: &Arc<Self>, protocol: Arc<ControllerProtocol>) {
        *self.protocol.lock().unwrap() = Some(protocol.clone());
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(self.clone().run_reader(protocol)));
        tasks.push(tokio::spawn(self.clone().run_flow_window_monitor()));
        tasks.push(tokio::spawn(self.clone().run_link_state_monitor()));
    }

    pub fn local_address(&self) -> Address {
        self.local_address
    }

    pub fn peer_address(&self) -> Address {
        self.peer_address
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn interrupt_socket(&self) -> Result<Arc<SeqPacket>, NotConnectedError> {
        self.itr.lock().unwrap().clone().ok_or(NotConnectedError)
    }

    /// Sends one report on the interrupt channel, honoring the flow window
    /// and the link-state pause.
    pub async fn write(&self, data: &[u8]) -> Result<(), NotConnectedError> {
        if self.is_closing() {
            return Err(NotConnectedError);
        }
        let _serial = self.write_serial.lock().await;
        self.write_window.acquire().await?;
        self.wait_writing_allowed().await?;

        let socket = self.interrupt_socket()?;
        self.capture_record(data);
        match socket.send(data).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("[BT] send error: {err}");
                self.notify_connection_lost();
                Err(NotConnectedError)
            }
        }
    }

    /// Receives one report from the interrupt channel. Zero bytes means the
    /// peer hung up; the caller reacts.
    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.wait_reading_allowed().await;
        let socket = self
            .interrupt_socket()
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let n = socket.recv(buf).await?;
        self.capture_record(&buf[..n]);
        Ok(n)
    }

    async fn wait_writing_allowed(&self) -> Result<(), NotConnectedError> {
        let mut allowed = self.writing_allowed.subscribe();
        while !*allowed.borrow_and_update() {
            allowed.changed().await.map_err(|_| NotConnectedError)?;
        }
        Ok(())
    }

    async fn wait_reading_allowed(&self) {
        let mut allowed = self.reading_allowed.subscribe();
        while !*allowed.borrow_and_update() {
            if allowed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn pause_writing(&self) {
        info!("[BT] pause transport write");
        self.writing_allowed.send_replace(false);
    }

    pub fn resume_writing(&self) {
        info!("[BT] resume transport write");
        self.writing_allowed.send_replace(true);
    }

    pub fn pause_reading(&self) {
        self.reading_allowed.send_replace(false);
    }

    pub fn resume_reading(&self) {
        self.reading_allowed.send_replace(true);
    }

    /// Appends `<f64 seconds> <i32 len> <payload>` to the capture sink.
    fn capture_record(&self, data: &[u8]) {
        let Some(file) = &self.capture else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut record = Vec::with_capacity(12 + data.len());
        record.extend_from_slice(&now.to_le_bytes());
        record.extend_from_slice(&(data.len() as i32).to_le_bytes());
        record.extend_from_slice(data);
        if let Err(err) = file.lock().unwrap().write_all(&record) {
            warn!("[BT] capture write failed: {err}");
        }
    }

    fn notify_connection_lost(&self) {
        if let Some(protocol) = self.protocol.lock().unwrap().take() {
            protocol.connection_lost();
        }
    }

    async fn run_reader(self: Arc<Self>, protocol: Arc<ControllerProtocol>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match self.read(&mut buf).await {
                Ok(0) => {
                    error!("[BT] no data received");
                    protocol.connection_lost();
                    break;
                }
                Ok(n) => protocol.report_received(&buf[..n]).await,
                Err(err) => {
                    if !self.is_closing() {
                        error!("[BT] read error: {err}");
                        protocol.connection_lost();
                    }
                    break;
                }
            }
        }
        debug!("[BT] reader exited");
    }

    /// Releases write-window credits as the adapter confirms completed
    /// packets (HCI event 0x13).
    async fn run_flow_window_monitor(self: Arc<Self>) {
        let socket = match HciEventSocket::open(0, EVT_NUM_COMP_PKTS) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("[BT] cannot monitor packet completion ({err}); flow control degraded");
                return;
            }
        };
        let mut buf = [0u8; 10];
        loop {
            match socket.recv(&mut buf).await {
                // [pkt type, event, plen, handles, handle lo, handle hi,
                //  completed lo, completed hi]
                Ok(n) if n >= 8 => {
                    let completed = buf[6] as usize + buf[7] as usize * 0x100;
                    self.write_window.release(completed);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("[BT] packet completion monitor failed: {err}");
                    return;
                }
            }
        }
    }

    /// Pauses writing for a second whenever the link drops below 5 slots
    /// (HCI event 0x1B).
    async fn run_link_state_monitor(self: Arc<Self>) {
        let socket = match HciEventSocket::open(0, EVT_MAX_SLOTS_CHANGE) {
            Ok(socket) => socket,
            Err(err) => {
                warn!("[BT] cannot monitor link state ({err})");
                return;
            }
        };
        let mut buf = [0u8; 10];
        loop {
            match socket.recv(&mut buf).await {
                // [pkt type, event, plen, handle lo, handle hi, max slots]
                Ok(n) if n >= 6 => {
                    if buf[5] < 5 {
                        self.pause_writing();
                        tokio::time::sleep(LINK_DEGRADED_PAUSE).await;
                        self.resume_writing();
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("[BT] link state monitor failed: {err}");
                    return;
                }
            }
        }
    }

    /// Cancels all tasks, closes both sockets and notifies the protocol.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pause_reading();
        self.pause_writing();
        self.write_window.close();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        // interrupt channel first, then control
        self.itr.lock().unwrap().take();
        self.ctr.lock().unwrap().take();

        self.notify_connection_lost();
        info!("[BT] transport closed");
    }
}
