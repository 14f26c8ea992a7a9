//! HID protocol engine.
//!
//! Reacts to the console's output reports, answers sub-commands with 0x21
//! replies, and owns the writer loop that streams periodic input reports once
//! the console has selected an input report mode. Sub-command handler errors
//! never propagate to the reader; they reduce to "no reply emitted".

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::transport::{L2capTransport, NotConnectedError};
use crate::controller::ControllerKind;
use crate::flash::FlashMemory;
use crate::mcu::MicroControllerUnit;
use crate::report::{
    InputReport, OutputReport, OutputReportId, SubCommand, TriggerButtonTimes,
};
use crate::state::ControllerState;

/// Buttons whose press closes the console's "Change Grip/Order" menu.
fn close_pairing_mask(kind: ControllerKind) -> [u8; 3] {
    match kind {
        // A, Home
        ControllerKind::JoyconR => [0x08, 0x10, 0x00],
        // Down, Left
        ControllerKind::JoyconL => [0x00, 0x00, 0x09],
        // A, B, Home
        ControllerKind::ProController => [0x0C, 0x10, 0x00],
    }
}

fn leaves_grip_menu(kind: ControllerKind, buttons: [u8; 3]) -> bool {
    let mask = close_pairing_mask(kind);
    buttons.iter().zip(mask).any(|(byte, mask)| byte & mask != 0)
}

struct Inner {
    transport: Option<Arc<L2capTransport>>,
    input_report_mode: Option<u8>,
    /// Grip-menu cadence until the first menu-closing button press.
    is_pairing: bool,
    timer: u8,
    writer: Option<JoinHandle<()>>,
}

pub struct ControllerProtocol {
    kind: ControllerKind,
    state: Arc<ControllerState>,
    flash: FlashMemory,
    mcu: Mutex<MicroControllerUnit>,
    inner: Mutex<Inner>,
    writer_wakeup: Notify,
    /// Latched once the first output report arrives.
    first_report: watch::Sender<bool>,
}

impl ControllerProtocol {
    pub fn new(kind: ControllerKind, flash: FlashMemory, reconnect: bool) -> Arc<Self> {
        let state = Arc::new(ControllerState::new(kind, &flash));
        let mcu = MicroControllerUnit::new(state.clone());
        Arc::new(Self {
            kind,
            state,
            flash,
            mcu: Mutex::new(mcu),
            inner: Mutex::new(Inner {
                transport: None,
                input_report_mode: None,
                is_pairing: !reconnect,
                timer: 0,
                writer: None,
            }),
            writer_wakeup: Notify::new(),
            first_report: watch::channel(false).0,
        })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn controller_state(&self) -> Arc<ControllerState> {
        self.state.clone()
    }

    // --- transport hooks ---

    pub fn connection_made(&self, transport: Arc<L2capTransport>) {
        debug!("[BT] connection established");
        self.inner.lock().unwrap().transport = Some(transport);
        self.state.mark_connected();
    }

    /// Tears down the session: stops the writer, closes the transport and
    /// fails pending `send()` waiters. Idempotent.
    pub fn connection_lost(&self) {
        let (transport, writer) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.transport.take(), inner.writer.take())
        };
        if transport.is_none() && writer.is_none() {
            return;
        }
        error!("[BT] connection lost");
        if let Some(writer) = writer {
            writer.abort();
        }
        if let Some(transport) = transport {
            tokio::spawn(async move { transport.close().await });
        }
        self.state.mark_disconnected();
        self.writer_wakeup.notify_one();
    }

    /// Resolves once the console has sent its first output report.
    pub async fn wait_for_output_report(&self) {
        let mut seen = self.first_report.subscribe();
        while !*seen.borrow_and_update() {
            if seen.changed().await.is_err() {
                return;
            }
        }
    }

    /// Reader entry point for every received output report.
    pub async fn report_received(self: &Arc<Self>, data: &[u8]) {
        self.first_report.send_replace(true);

        let report = match OutputReport::parse(data) {
            Ok(report) => report,
            Err(err) => {
                warn!("[BT] report parsing error \"{err}\" - ignoring");
                return;
            }
        };
        match report.report_id() {
            OutputReportId::SubCommand => self.reply_to_sub_command(&report).await,
            OutputReportId::RumbleOnly => {
                // rumble data is ignored
            }
            OutputReportId::RequestMcu => {
                self.mcu
                    .lock()
                    .unwrap()
                    .received_11(report.sub_command(), report.sub_command_data());
            }
            OutputReportId::Unknown(id) => {
                warn!("[BT] output report {id:#04x} not implemented - ignoring");
            }
        }
    }

    // --- report generation and emission ---

    /// Builds an input report of the given mode from the current controller
    /// state, stamping and advancing the report timer.
    fn generate_input_report(&self, mode: u8) -> InputReport {
        let mut report = InputReport::new();
        report.set_report_id(mode);
        if mode == 0x3F {
            report.set_simple_report_constants();
            return report;
        }

        let timer = {
            let mut inner = self.inner.lock().unwrap();
            let timer = inner.timer;
            inner.timer = inner.timer.wrapping_add(1);
            timer
        };
        report.set_timer(timer);
        report.set_misc();
        report.set_button_status(self.state.button_state().bytes());
        report.set_stick_status(self.state.l_stick_bytes(), self.state.r_stick_bytes());
        report.set_vibrator_input();
        if mode == 0x30 || mode == 0x31 {
            report.set_6axis_data();
        }
        if mode == 0x31 {
            let frame = self.mcu.lock().unwrap().get_data();
            report.set_mcu_data(&frame);
        }
        report
    }

    /// Emits one report and fires the controller-state send signal. The
    /// signal stays unset when the write fails.
    async fn write_report(&self, report: &InputReport) -> Result<(), NotConnectedError> {
        let transport = {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_pairing && leaves_grip_menu(self.kind, report.button_status()) {
                info!("[BT] left change grip/order menu");
                inner.is_pairing = false;
                self.writer_wakeup.notify_one();
            }
            inner.transport.clone().ok_or(NotConnectedError)?
        };
        let bytes = match report.as_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("[BT] refusing to send malformed report: {err}");
                return Ok(());
            }
        };
        transport.write(bytes).await?;
        self.state.notify_sent();
        Ok(())
    }

    // --- sub-command dispatch ---

    async fn reply_to_sub_command(self: &Arc<Self>, report: &OutputReport) {
        let sub_command = SubCommand::from_byte(report.sub_command());
        let data = report.sub_command_data();
        info!("[BT] received sub-command {sub_command:?}");

        let mut response = self.generate_input_report(0x21);
        let mut input_ready = false;

        match sub_command {
            SubCommand::RequestDeviceInfo => {
                let Some(mac) = self.local_mac() else {
                    warn!("[BT] device info requested without a transport");
                    return;
                };
                response.set_ack(0x82);
                response.sub_0x02_device_info(mac, self.kind);
            }
            SubCommand::SetInputReportMode => {
                let Some(&mode) = data.first() else {
                    warn!("[BT] set input report mode without payload - ignoring");
                    return;
                };
                self.set_input_report_mode(mode);
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x03);
            }
            SubCommand::TriggerButtonsElapsedTime => {
                response.set_ack(0x83);
                let times = TriggerButtonTimes::pairing(self.kind);
                if let Err(err) = response.sub_0x04_trigger_buttons_elapsed_time(times) {
                    error!("[BT] failed to answer {sub_command:?} - {err}");
                    return;
                }
            }
            SubCommand::SetShipmentState => {
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x08);
            }
            SubCommand::SpiFlashRead => {
                let (Some(offset), Some(&size)) = (
                    data.get(0..4)
                        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                        .map(u32::from_le_bytes),
                    data.get(4),
                ) else {
                    warn!("[BT] truncated spi flash read request - ignoring");
                    return;
                };
                let slice = match self.flash.read(offset, size) {
                    Ok(slice) => slice,
                    Err(err) => {
                        error!("[BT] spi flash read rejected: {err}");
                        return;
                    }
                };
                response.set_ack(0x90);
                if let Err(err) = response.sub_0x10_spi_flash_read(offset, slice) {
                    error!("[BT] failed to answer {sub_command:?} - {err}");
                    return;
                }
            }
            SubCommand::SetNfcIrMcuConfig => {
                self.mcu.lock().unwrap().set_config(data);
                response.set_ack(0xA0);
                response.sub_0x21_set_mcu_config();
            }
            SubCommand::SetNfcIrMcuState => {
                let Some(&power) = data.first() else {
                    warn!("[BT] set MCU state without payload - ignoring");
                    return;
                };
                if power > 0x01 {
                    error!("[BT] MCU power state {power:#04x} not implemented");
                    return;
                }
                self.mcu.lock().unwrap().set_power_state(power);
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x22);
            }
            SubCommand::SetPlayerLights => {
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x30);
                input_ready = true;
            }
            SubCommand::Enable6AxisSensor => {
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x40);
            }
            SubCommand::EnableVibration => {
                response.set_ack(0x80);
                response.reply_to_subcommand_id(0x48);
            }
            SubCommand::Unknown(id) => {
                warn!("[BT] sub-command {id:#04x} not implemented - ignoring");
                return;
            }
        }

        if self.write_report(&response).await.is_err() {
            warn!("[BT] could not reply to {sub_command:?}");
            return;
        }

        if input_ready {
            // the console accepts button input from here on
            self.state.set_input_ready();
            self.start_writer();
        }
    }

    fn set_input_report_mode(&self, mode: u8) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.input_report_mode == Some(mode) {
                warn!("[BT] already in input report mode {mode:#04x}");
            }
            if !matches!(mode, 0x30 | 0x31) {
                warn!("[BT] unexpected input report mode {mode:#04x}");
            }
            inner.input_report_mode = Some(mode);
        }
        if mode == 0x31 {
            self.mcu.lock().unwrap().entered_31_input_mode();
        }
        self.writer_wakeup.notify_one();
    }

    fn local_mac(&self) -> Option<[u8; 6]> {
        self.inner
            .lock()
            .unwrap()
            .transport
            .as_ref()
            .map(|transport| transport.local_address().0)
    }

    // --- writer loop ---

    fn start_writer(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.writer.as_ref().is_some_and(|writer| !writer.is_finished()) {
            return;
        }
        let protocol = self.clone();
        inner.writer = Some(tokio::spawn(async move { protocol.run_writer().await }));
    }

    /// Report ID the writer should emit right now; `None` parks the writer
    /// until a sub-command changes the mode.
    fn writer_report_mode(&self) -> Option<u8> {
        let inner = self.inner.lock().unwrap();
        if inner.is_pairing {
            Some(inner.input_report_mode.unwrap_or(0x3F))
        } else {
            inner.input_report_mode
        }
    }

    /// Emission cadence for the current mode.
    fn send_delay(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        if inner.is_pairing {
            return Some(Duration::from_secs_f64(1.0 / 15.0));
        }
        match inner.input_report_mode {
            Some(0x30) | Some(0x31) => Some(Duration::from_secs_f64(1.0 / 60.0)),
            Some(0x3F) => Some(Duration::from_secs(1)),
            Some(mode) => {
                warn!("[BT] unknown delay for mode {mode:#04x}, assuming 1/15");
                Some(Duration::from_secs_f64(1.0 / 15.0))
            }
            None => None,
        }
    }

    async fn run_writer(self: Arc<Self>) {
        info!("[BT] writer started");
        loop {
            if self.inner.lock().unwrap().transport.is_none() {
                break;
            }
            let Some(mode) = self.writer_report_mode() else {
                // sub-command-only phase: emissions happen per reply
                self.writer_wakeup.notified().await;
                continue;
            };

            let started = Instant::now();
            let report = self.generate_input_report(mode);
            if self.write_report(&report).await.is_err() {
                break;
            }
            let Some(delay) = self.send_delay() else {
                continue;
            };
            let elapsed = started.elapsed();
            if elapsed > delay {
                warn!("[BT] writer running {:?} behind", elapsed - delay);
            }
            tokio::select! {
                _ = tokio::time::sleep(delay.saturating_sub(elapsed)) => {}
                _ = self.writer_wakeup.notified() => {}
            }
        }
        warn!("[BT] writer exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::crc8;
    use crate::state::ButtonId;

    fn protocol(kind: ControllerKind) -> Arc<ControllerProtocol> {
        ControllerProtocol::new(kind, FlashMemory::new(), false)
    }

    #[test]
    fn test_grip_menu_masks() {
        // Pro Controller: A, B or Home close the menu
        let kind = ControllerKind::ProController;
        let state = ControllerState::new(kind, &FlashMemory::new());
        for button in [ButtonId::A, ButtonId::B, ButtonId::Home] {
            state.clear_buttons();
            state.set_button(button, true).unwrap();
            assert!(leaves_grip_menu(kind, state.button_state().bytes()), "{button}");
        }
        state.clear_buttons();
        state.set_button(ButtonId::X, true).unwrap();
        assert!(!leaves_grip_menu(kind, state.button_state().bytes()));

        // Joy-Con L: Down or Left
        let kind = ControllerKind::JoyconL;
        let state = ControllerState::new(kind, &FlashMemory::new());
        for button in [ButtonId::Down, ButtonId::Left] {
            state.clear_buttons();
            state.set_button(button, true).unwrap();
            assert!(leaves_grip_menu(kind, state.button_state().bytes()), "{button}");
        }
        state.clear_buttons();
        state.set_button(ButtonId::Up, true).unwrap();
        assert!(!leaves_grip_menu(kind, state.button_state().bytes()));

        // Joy-Con R: A or Home
        let kind = ControllerKind::JoyconR;
        let state = ControllerState::new(kind, &FlashMemory::new());
        for button in [ButtonId::A, ButtonId::Home] {
            state.clear_buttons();
            state.set_button(button, true).unwrap();
            assert!(leaves_grip_menu(kind, state.button_state().bytes()), "{button}");
        }
        state.clear_buttons();
        state.set_button(ButtonId::B, true).unwrap();
        assert!(!leaves_grip_menu(kind, state.button_state().bytes()));
    }

    #[test]
    fn test_generated_report_reflects_state() {
        let protocol = protocol(ControllerKind::ProController);
        let state = protocol.controller_state();
        state.set_button(ButtonId::A, true).unwrap();
        state.with_l_stick(|stick| stick.set_up()).unwrap();

        let report = protocol.generate_input_report(0x30);
        let bytes = report.as_bytes().unwrap().to_vec();
        assert_eq!(bytes[1], 0x30);
        assert_eq!(bytes[3], 0x8E);
        assert_eq!(bytes[4] & 0x08, 0x08); // A
        // stick v pushed to 0xF00: [h & 0xFF, h>>8 | (v & 0xF) << 4, v >> 4]
        assert_eq!(&bytes[7..10], &[0x00, 0x08, 0xF0]);
        assert_eq!(bytes[13], 0x80);
    }

    #[test]
    fn test_timer_wraps_per_emission() {
        let protocol = protocol(ControllerKind::ProController);
        protocol.inner.lock().unwrap().timer = 0xFF;
        let report = protocol.generate_input_report(0x30);
        assert_eq!(report.as_bytes().unwrap()[2], 0xFF);
        let report = protocol.generate_input_report(0x30);
        assert_eq!(report.as_bytes().unwrap()[2], 0x00);
    }

    #[test]
    fn test_simple_mode_report_has_no_timer() {
        let protocol = protocol(ControllerKind::ProController);
        let report = protocol.generate_input_report(0x3F);
        let bytes = report.as_bytes().unwrap();
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[1], 0x3F);
        // the timer was not advanced
        assert_eq!(protocol.inner.lock().unwrap().timer, 0);
    }

    #[test]
    fn test_0x31_report_carries_checksummed_mcu_payload() {
        let protocol = protocol(ControllerKind::ProController);
        protocol.set_input_report_mode(0x31);
        let report = protocol.generate_input_report(0x31);
        let bytes = report.as_bytes().unwrap().to_vec();
        assert_eq!(bytes.len(), 363);
        // first drained frame is the READY status queued on mode entry
        assert_eq!(&bytes[50..58], &[0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x1B, 0x01]);
        assert_eq!(bytes[362], crc8(&bytes[50..362]));

        // queue drained: subsequent reports carry the no-response frame
        let report = protocol.generate_input_report(0x31);
        let bytes = report.as_bytes().unwrap().to_vec();
        assert_eq!(bytes[50], 0xFF);
        assert_eq!(bytes[362], crc8(&bytes[50..362]));
    }

    #[test]
    fn test_cadence_selection() {
        let protocol = protocol(ControllerKind::ProController);
        // pairing cadence before any mode is set
        assert_eq!(protocol.writer_report_mode(), Some(0x3F));
        assert_eq!(protocol.send_delay(), Some(Duration::from_secs_f64(1.0 / 15.0)));

        protocol.set_input_report_mode(0x30);
        // still pairing: slow cadence, but the selected mode
        assert_eq!(protocol.writer_report_mode(), Some(0x30));
        assert_eq!(protocol.send_delay(), Some(Duration::from_secs_f64(1.0 / 15.0)));

        protocol.inner.lock().unwrap().is_pairing = false;
        assert_eq!(protocol.send_delay(), Some(Duration::from_secs_f64(1.0 / 60.0)));
    }

    #[test]
    fn test_reconnect_skips_pairing_cadence() {
        let protocol = ControllerProtocol::new(
            ControllerKind::ProController,
            FlashMemory::new(),
            true,
        );
        // no mode yet: the writer parks instead of emitting 0x3F
        assert_eq!(protocol.writer_report_mode(), None);
        assert_eq!(protocol.send_delay(), None);
    }
}
