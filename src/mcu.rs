//! Emulation of the NFC/IR micro-controller in the right Joy-Con and the
//! Pro Controller.
//!
//! The console drives the MCU through 0x11 output reports; the MCU cannot
//! answer directly and instead queues 313-byte frames that the writer loop
//! drains into 0x31 input reports. This implementation is sufficient to poll,
//! read and write one amiibo per session; the IR camera is not emulated.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::report::{crc8, MCU_PAYLOAD_SIZE};
use crate::state::ControllerState;

/// One queued MCU frame, checksummed in its final byte.
pub type McuFrame = [u8; MCU_PAYLOAD_SIZE];

/// Queue length after which droppable frames are discarded.
const MAX_RESPONSE_QUEUE_LEN: usize = 4;

/// Status emissions that pretend the tag was removed after a completed write.
const REMOVED_TAG_EMISSIONS: u8 = 3;

/// Filler block of the first read frame. Meaning unknown; the console expects
/// these bytes verbatim.
const READ_FILLER: [u8; 45] = [
    0x00, 0x00, 0x00, 0x00, 0x7D, 0xFD, 0xF0, 0x79, 0x36, 0x51, 0xAB, 0xD7, 0x46, 0x6E, 0x39,
    0xC1, 0x91, 0xBA, 0xBE, 0xB8, 0x56, 0xCE, 0xED, 0xF1, 0xCE, 0x44, 0xCC, 0x75, 0xEA, 0xFB,
    0x27, 0x09, 0x4D, 0x08, 0x7A, 0xE8, 0x03, 0x00, 0x3B, 0x3C, 0x77, 0x78, 0x86, 0x00, 0x00,
];

/// Filler block of the write acknowledgement frame. Also unexplained.
const WRITE_ACK_FILLER: [u8; 49] = [
    0x00, 0x00, 0x00, 0x00, 0xFD, 0xB0, 0xC0, 0xA4, 0x34, 0xC9, 0xBF, 0x31, 0x69, 0x00, 0x30,
    0xAA, 0xEF, 0x56, 0x44, 0x4B, 0x0F, 0x60, 0x26, 0x27, 0x36, 0x6D, 0x5A, 0x28, 0x1A, 0xDC,
    0x69, 0x7F, 0xDE, 0x0D, 0x6C, 0xBC, 0x01, 0x03, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xF1, 0x10, 0xFF, 0xEE,
];

/// MCU power states as they appear in set-power, set-config and status
/// packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McuPowerState {
    Suspended,
    Ready,
    ReadyUpdate,
    ConfiguredNfc,
}

impl McuPowerState {
    pub fn byte(self) -> u8 {
        match self {
            McuPowerState::Suspended => 0x00,
            McuPowerState::Ready => 0x01,
            McuPowerState::ReadyUpdate => 0x02,
            McuPowerState::ConfiguredNfc => 0x04,
        }
    }
}

/// NFC engine sub-states; only meaningful while the MCU is configured for
/// NFC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NfcState {
    None,
    Poll,
    PollAgain,
    AwaitingWrite,
    Writing,
    ProcessingWrite,
}

impl NfcState {
    pub fn byte(self) -> u8 {
        match self {
            NfcState::None => 0x00,
            NfcState::Poll => 0x01,
            NfcState::ProcessingWrite => 0x02,
            NfcState::Writing => 0x03,
            NfcState::AwaitingWrite => 0x04,
            NfcState::PollAgain => 0x09,
        }
    }

    /// States in which a status frame carries the tag UID block.
    fn reports_tag(self) -> bool {
        matches!(
            self,
            NfcState::Poll
                | NfcState::PollAgain
                | NfcState::AwaitingWrite
                | NfcState::Writing
                | NfcState::ProcessingWrite
        )
    }
}

/// Builds a checksummed 313-byte MCU frame from concatenated parts.
fn pack_frame(parts: &[&[u8]]) -> McuFrame {
    let mut frame = [0u8; MCU_PAYLOAD_SIZE];
    let mut cursor = 0;
    for part in parts {
        if cursor + part.len() > MCU_PAYLOAD_SIZE - 1 {
            warn!("[MCU] overlong frame packed, truncating");
            let fit = MCU_PAYLOAD_SIZE - 1 - cursor;
            frame[cursor..cursor + fit].copy_from_slice(&part[..fit]);
            cursor += fit;
            break;
        }
        frame[cursor..cursor + part.len()].copy_from_slice(part);
        cursor += part.len();
    }
    frame[MCU_PAYLOAD_SIZE - 1] = crc8(&frame[..MCU_PAYLOAD_SIZE - 1]);
    frame
}

pub struct MicroControllerUnit {
    power_state: McuPowerState,
    nfc_state: NfcState,
    /// Shared controller state; carries the tag the external driver loaded.
    controller: Arc<ControllerState>,
    /// UID seen during the last poll, for re-poll detection.
    last_poll_uid: Option<[u8; 7]>,
    seq_no: u8,
    ack_seq_no: u8,
    /// Reassembly buffer for multi-packet writes.
    received_data: Vec<u8>,
    /// While nonzero, status frames pretend the (zeroed) tag was removed.
    removed_tag_emissions: u8,
    /// Pre-packed frame returned whenever the queue is empty.
    no_response: McuFrame,
    response_queue: VecDeque<McuFrame>,
    /// A read burst must drain before the next read is accepted.
    read_in_flight: bool,
}

impl MicroControllerUnit {
    pub fn new(controller: Arc<ControllerState>) -> Self {
        Self {
            power_state: McuPowerState::Suspended,
            nfc_state: NfcState::None,
            controller,
            last_poll_uid: None,
            seq_no: 0,
            ack_seq_no: 0,
            received_data: Vec::new(),
            removed_tag_emissions: 0,
            no_response: pack_frame(&[&[0xFF]]),
            response_queue: VecDeque::new(),
            read_in_flight: false,
        }
    }

    pub fn power_state(&self) -> McuPowerState {
        self.power_state
    }

    pub fn nfc_state(&self) -> NfcState {
        self.nfc_state
    }

    fn flush_response_queue(&mut self) {
        self.response_queue.clear();
        self.read_in_flight = false;
    }

    fn queue_response(&mut self, frame: McuFrame) {
        if self.response_queue.len() < MAX_RESPONSE_QUEUE_LEN {
            self.response_queue.push_back(frame);
        } else {
            warn!("[MCU] response queue full, dropped frame");
        }
    }

    /// Queue bypass for frames the console must not lose (read burst, write
    /// ack).
    fn force_queue_response(&mut self, frame: McuFrame) {
        self.response_queue.push_back(frame);
        if self.response_queue.len() > MAX_RESPONSE_QUEUE_LEN {
            warn!("[MCU] response queue forced over limit");
        }
    }

    /// Status packet answering plain 0x11/0x01 requests.
    fn status_data(&self) -> McuFrame {
        if self.power_state == McuPowerState::Suspended {
            warn!("[MCU] status request while suspended");
            return self.no_response;
        }
        pack_frame(&[
            &[0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x1B],
            &[self.power_state.byte()],
        ])
    }

    /// Current tag UID as the status frame should report it, applying the
    /// removed-tag synthesis after a write.
    fn presented_uid(&mut self) -> Option<[u8; 7]> {
        if self.removed_tag_emissions > 0 {
            self.removed_tag_emissions -= 1;
            if self.removed_tag_emissions == 0 && self.nfc_state == NfcState::ProcessingWrite {
                self.nfc_state = NfcState::Poll;
            }
            // a freshly zeroed 540-byte tag
            return Some([0u8; 7]);
        }
        self.controller
            .nfc()
            .map(|handle| handle.lock().unwrap().uid())
    }

    /// NFC status frame; generating it also advances the polling state.
    fn nfc_status_data(&mut self) -> McuFrame {
        let uid = self.presented_uid();
        let state = self.nfc_state;

        let mut next_state = state;
        match state {
            NfcState::Poll => {
                if let Some(uid) = uid {
                    info!("[MCU] polled and found tag");
                    self.last_poll_uid = Some(uid);
                    next_state = NfcState::PollAgain;
                }
            }
            NfcState::PollAgain => {
                if uid.is_none() || uid != self.last_poll_uid {
                    self.last_poll_uid = None;
                    next_state = NfcState::Poll;
                }
            }
            _ => {}
        }

        let frame = match uid {
            Some(uid) if state.reports_tag() => pack_frame(&[
                &[0x2A, 0x00, 0x05],
                &[self.seq_no],
                &[self.ack_seq_no],
                &[0x09, 0x31],
                &[state.byte()],
                &[0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x00, 0x07],
                &uid,
            ]),
            _ => pack_frame(&[
                &[0x2A, 0x00, 0x05],
                &[self.seq_no],
                &[self.ack_seq_no],
                &[0x09, 0x31],
                &[state.byte()],
            ]),
        };
        self.nfc_state = next_state;
        frame
    }

    /// Called by the protocol engine when input report mode 0x31 is entered.
    pub fn entered_31_input_mode(&mut self) {
        self.flush_response_queue();
        self.power_state = McuPowerState::Ready;
        let status = self.status_data();
        self.queue_response(status);
    }

    /// SET_NFC_IR_MCU_STATE handler.
    pub fn set_power_state(&mut self, power: u8) {
        info!("[MCU] set power state {power:#04x}");
        self.flush_response_queue();
        self.power_state = match power {
            0x00 => McuPowerState::Suspended,
            0x01 => McuPowerState::Ready,
            other => {
                error!("[MCU] unimplemented power state {other:#04x}");
                McuPowerState::Ready
            }
        };
        let status = self.status_data();
        self.queue_response(status);
    }

    /// SET_NFC_IR_MCU_CONFIG handler; `config[2]` selects the target state.
    pub fn set_config(&mut self, config: &[u8]) {
        let Some(&target) = config.get(2) else {
            warn!("[MCU] truncated configuration command");
            return;
        };
        match self.power_state {
            McuPowerState::Suspended => {
                if target != 0 {
                    warn!("[MCU] set config while suspended");
                }
                // config byte 0 while suspended: the console probing during
                // initial setup
            }
            McuPowerState::Ready | McuPowerState::ConfiguredNfc => {
                self.power_state = match target {
                    0x01 => McuPowerState::Ready,
                    0x04 => McuPowerState::ConfiguredNfc,
                    other => {
                        error!("[MCU] unimplemented configuration {other:#04x}");
                        McuPowerState::Ready
                    }
                };
                info!("[MCU] configured {:?}", self.power_state);
                self.nfc_state = NfcState::None;
                self.last_poll_uid = None;
                let status = self.status_data();
                self.queue_response(status);
            }
            McuPowerState::ReadyUpdate => {
                warn!("[MCU] set config during firmware update state");
            }
        }
    }

    /// Entry point for 0x11 output reports: `(sub-command, data)`.
    pub fn received_11(&mut self, sub_command: u8, data: &[u8]) {
        match sub_command {
            0x01 => {
                let status = self.status_data();
                self.queue_response(status);
            }
            0x02 => {
                if self.power_state != McuPowerState::ConfiguredNfc {
                    warn!("[MCU] NFC command outside NFC mode, ignoring");
                } else if data.is_empty() {
                    warn!("[MCU] empty NFC command");
                } else {
                    self.handle_nfc_subcommand(data[0], &data[1..]);
                }
            }
            other => error!("[MCU] unknown 0x11 sub-command {other:#04x}"),
        }
    }

    fn handle_nfc_subcommand(&mut self, selector: u8, data: &[u8]) {
        match selector {
            0x04 => {
                let status = self.nfc_status_data();
                self.force_queue_response(status);
            }
            0x01 => {
                info!("[MCU] start polling");
                self.nfc_state = NfcState::Poll;
            }
            0x02 => {
                info!("[MCU] stop polling");
                self.nfc_state = NfcState::None;
                self.last_poll_uid = None;
            }
            0x06 => {
                let Some(target_uid) = data.get(6..13) else {
                    warn!("[MCU] truncated read/write initiation");
                    return;
                };
                if target_uid.iter().all(|&b| b == 0) {
                    self.start_read();
                } else {
                    self.start_write();
                }
            }
            0x08 => self.receive_write_fragment(data),
            other => error!("[MCU] unhandled NFC sub-command {other:#04x}"),
        }
    }

    /// Read request with a zeroed UID: burst the whole tag in three fixed
    /// frames. Further reads are refused until the burst has drained.
    fn start_read(&mut self) {
        if self.read_in_flight {
            debug!("[MCU] read burst still draining, ignoring read request");
            return;
        }
        let Some(handle) = self.controller.nfc() else {
            warn!("[MCU] read requested without a tag");
            return;
        };
        let tag = handle.lock().unwrap();
        let uid = tag.uid();
        info!("[MCU] reading tag");

        self.flush_response_queue();
        self.force_queue_response(pack_frame(&[
            &[
                0x3A, 0x00, 0x07, 0x01, 0x00, 0x01, 0x31, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02,
                0x00, 0x07,
            ],
            &uid,
            &READ_FILLER,
            &tag.data()[0..245],
        ]));
        self.force_queue_response(pack_frame(&[
            &[0x3A, 0x00, 0x07, 0x02, 0x00, 0x09, 0x27],
            &tag.data()[245..540],
        ]));
        self.force_queue_response(pack_frame(&[
            &[
                0x2A, 0x00, 0x05, 0x00, 0x00, 0x09, 0x31, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01,
                0x02, 0x00, 0x07,
            ],
            &uid,
        ]));
        self.read_in_flight = true;
    }

    /// Read request with a nonzero UID announces a write: acknowledge and
    /// await fragments.
    fn start_write(&mut self) {
        let Some(handle) = self.controller.nfc() else {
            warn!("[MCU] write requested without a tag");
            return;
        };
        let uid = handle.lock().unwrap().uid();
        info!("[MCU] write announced");
        self.force_queue_response(pack_frame(&[
            &[
                0x3A, 0x00, 0x07, 0x01, 0x00, 0x08, 0x40, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02,
                0x00, 0x07,
            ],
            &uid,
            &WRITE_ACK_FILLER,
        ]));
        self.received_data.clear();
        self.ack_seq_no = 0;
        self.nfc_state = NfcState::AwaitingWrite;
    }

    /// One write fragment: `<seq> <unused> <end-flag> <len> <payload>`.
    fn receive_write_fragment(&mut self, data: &[u8]) {
        if data.len() < 4 {
            warn!("[MCU] truncated write fragment");
            return;
        }
        let seq = data[0];
        let end_flag = data[2];
        let len = data[3] as usize;
        let Some(payload) = data.get(4..4 + len) else {
            warn!("[MCU] write fragment shorter than its length field");
            return;
        };

        if seq == self.ack_seq_no {
            // duplicate, already applied
        } else if seq == self.ack_seq_no.wrapping_add(1) {
            self.received_data.extend_from_slice(payload);
            self.ack_seq_no = seq;
        } else {
            warn!(
                "[MCU] write fragment out of sequence (got {seq}, acked {})",
                self.ack_seq_no
            );
            self.ack_seq_no = 0;
            self.received_data.clear();
            self.nfc_state = NfcState::AwaitingWrite;
            let status = self.nfc_status_data();
            self.force_queue_response(status);
            return;
        }

        if end_flag == 0x08 {
            self.nfc_state = NfcState::ProcessingWrite;
            self.ack_seq_no = 0;
            let command = std::mem::take(&mut self.received_data);
            self.apply_tag_write(&command);
            self.removed_tag_emissions = REMOVED_TAG_EMISSIONS;
        } else {
            self.nfc_state = NfcState::Writing;
        }
        let status = self.nfc_status_data();
        self.force_queue_response(status);
    }

    /// Applies a reassembled write command to the tag and persists it.
    fn apply_tag_write(&mut self, command: &[u8]) {
        let Some(handle) = self.controller.nfc() else {
            warn!("[MCU] write completed without a tag");
            return;
        };
        if command.len() < 22 {
            warn!("[MCU] reassembled write too short ({} bytes)", command.len());
            return;
        }
        if command[1] != 0x07 {
            warn!("[MCU] write command with bad UID length {:#04x}", command[1]);
            return;
        }
        let mut tag = handle.lock().unwrap();
        if command[2..9] != tag.uid() {
            warn!("[MCU] write command UID mismatch, refusing");
            return;
        }

        if let Err(err) = tag.make_mutable() {
            error!("[NFC] could not back up tag before write: {err}");
            return;
        }

        // addressed write preceding the page triples
        tag.write(command[12] as usize * 4, &command[13..17]);

        let mut i = 22;
        while i + 1 < command.len() {
            let addr = command[i] as usize * 4;
            let len = command[i + 1] as usize;
            if addr == 0 || len == 0 {
                break;
            }
            let Some(data) = command.get(i + 2..i + 2 + len) else {
                warn!("[MCU] truncated write chunk at offset {i}");
                break;
            };
            tag.write(addr, data);
            i += 2 + len;
        }

        if let Err(err) = tag.save() {
            error!("[NFC] failed to save written tag: {err}");
        } else {
            info!("[MCU] tag write applied");
        }
    }

    /// Payload for the next 0x31 input report: the oldest queued frame, or
    /// the cached no-response frame.
    pub fn get_data(&mut self) -> McuFrame {
        match self.response_queue.pop_front() {
            Some(frame) => {
                if self.response_queue.is_empty() {
                    self.read_in_flight = false;
                }
                frame
            }
            None => self.no_response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerKind;
    use crate::flash::FlashMemory;
    use crate::nfc::{NfcTag, TAG_SIZE};

    const UID: [u8; 7] = [0x04, 0x88, 0xCA, 0xA5, 0x62, 0x5F, 0x80];

    fn tag_bytes() -> Vec<u8> {
        let mut data: Vec<u8> = (0..TAG_SIZE).map(|i| (i % 251) as u8).collect();
        data[0..8].copy_from_slice(&[0x04, 0x88, 0xCA, 0x99, 0xA5, 0x62, 0x5F, 0x80]);
        data
    }

    fn state_with_tag() -> Arc<ControllerState> {
        let state = Arc::new(ControllerState::new(
            ControllerKind::ProController,
            &FlashMemory::new(),
        ));
        state.set_nfc(Some(NfcTag::new(tag_bytes(), false, None)));
        state
    }

    fn nfc_configured(state: &Arc<ControllerState>) -> MicroControllerUnit {
        let mut mcu = MicroControllerUnit::new(state.clone());
        mcu.set_power_state(0x01);
        mcu.set_config(&[0x00, 0x00, 0x04]);
        mcu.flush_response_queue();
        mcu
    }

    fn assert_checksummed(frame: &McuFrame) {
        assert_eq!(frame[312], crc8(&frame[..312]));
    }

    #[test]
    fn test_no_response_while_suspended() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        let frame = mcu.get_data();
        assert_eq!(frame[0], 0xFF);
        assert_eq!(&frame[1..312], &[0u8; 311]);
        assert_checksummed(&frame);

        // a status request while suspended also yields no-response
        mcu.received_11(0x01, &[]);
        let frame = mcu.get_data();
        assert_eq!(frame[0], 0xFF);
    }

    #[test]
    fn test_power_up_queues_status() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        mcu.set_power_state(0x01);
        let frame = mcu.get_data();
        assert_eq!(&frame[0..8], &[0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x1B, 0x01]);
        assert_checksummed(&frame);
    }

    #[test]
    fn test_unknown_power_state_forces_ready() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        mcu.set_power_state(0x77);
        assert_eq!(mcu.power_state(), McuPowerState::Ready);
    }

    #[test]
    fn test_config_probe_while_suspended_is_noop() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        mcu.set_config(&[0x00, 0x00, 0x00]);
        assert_eq!(mcu.power_state(), McuPowerState::Suspended);
        assert!(mcu.response_queue.is_empty());
    }

    #[test]
    fn test_config_roundtrip_restores_ready() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        assert_eq!(mcu.power_state(), McuPowerState::ConfiguredNfc);
        assert_eq!(mcu.nfc_state(), NfcState::None);

        mcu.received_11(0x02, &[0x01]);
        assert_eq!(mcu.nfc_state(), NfcState::Poll);

        mcu.set_config(&[0x00, 0x00, 0x01]);
        assert_eq!(mcu.power_state(), McuPowerState::Ready);
        assert_eq!(mcu.nfc_state(), NfcState::None);
    }

    #[test]
    fn test_entered_31_mode_flushes_and_readies() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x04]);
        assert!(!mcu.response_queue.is_empty());

        mcu.entered_31_input_mode();
        assert_eq!(mcu.power_state(), McuPowerState::Ready);
        assert_eq!(mcu.response_queue.len(), 1);
        let frame = mcu.get_data();
        assert_eq!(&frame[0..8], &[0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x1B, 0x01]);
    }

    #[test]
    fn test_poll_transitions() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);
        assert_eq!(mcu.nfc_state(), NfcState::Poll);

        // status emission while a tag is present: report + advance
        mcu.received_11(0x02, &[0x04]);
        let frame = mcu.get_data();
        assert_eq!(&frame[0..3], &[0x2A, 0x00, 0x05]);
        assert_eq!(&frame[5..8], &[0x09, 0x31, 0x01]); // still reports POLL
        assert_eq!(&frame[8..16], &[0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x00, 0x07]);
        assert_eq!(&frame[16..23], &UID);
        assert_checksummed(&frame);
        assert_eq!(mcu.nfc_state(), NfcState::PollAgain);

        // tag removed: fall back to polling
        state.set_nfc(None);
        mcu.received_11(0x02, &[0x04]);
        let frame = mcu.get_data();
        assert_eq!(&frame[0..3], &[0x2A, 0x00, 0x05]);
        assert_eq!(frame[7], NfcState::PollAgain.byte());
        // no UID block without a tag
        assert_eq!(&frame[8..16], &[0u8; 8]);
        assert_eq!(mcu.nfc_state(), NfcState::Poll);
    }

    #[test]
    fn test_poll_without_tag_stays_polling() {
        let state = Arc::new(ControllerState::new(
            ControllerKind::ProController,
            &FlashMemory::new(),
        ));
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);
        mcu.received_11(0x02, &[0x04]);
        let _ = mcu.get_data();
        assert_eq!(mcu.nfc_state(), NfcState::Poll);
    }

    #[test]
    fn test_stop_polling_clears_uid_memory() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);
        mcu.received_11(0x02, &[0x04]);
        let _ = mcu.get_data();
        assert!(mcu.last_poll_uid.is_some());
        mcu.received_11(0x02, &[0x02]);
        assert_eq!(mcu.nfc_state(), NfcState::None);
        assert!(mcu.last_poll_uid.is_none());
    }

    #[test]
    fn test_queue_bounded_with_drop() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        mcu.set_power_state(0x01);
        mcu.flush_response_queue();
        for _ in 0..6 {
            mcu.received_11(0x01, &[]);
        }
        assert_eq!(mcu.response_queue.len(), MAX_RESPONSE_QUEUE_LEN);
    }

    fn read_request(mcu: &mut MicroControllerUnit) {
        // selector 0x06 with a zeroed 7-byte UID at data offset 6
        let mut data = vec![0x06];
        data.extend_from_slice(&[0u8; 13]);
        mcu.received_11(0x02, &data);
    }

    #[test]
    fn test_read_burst_frames() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);
        read_request(&mut mcu);
        assert_eq!(mcu.response_queue.len(), 3);

        let first = mcu.get_data();
        assert_eq!(
            &first[0..15],
            &[0x3A, 0x00, 0x07, 0x01, 0x00, 0x01, 0x31, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x07]
        );
        assert_eq!(&first[15..22], &UID);
        assert_eq!(&first[22..67], &READ_FILLER);
        assert_eq!(&first[67..312], &tag_bytes()[0..245]);
        assert_checksummed(&first);

        let second = mcu.get_data();
        assert_eq!(&second[0..7], &[0x3A, 0x00, 0x07, 0x02, 0x00, 0x09, 0x27]);
        assert_eq!(&second[7..302], &tag_bytes()[245..540]);
        assert_eq!(&second[302..312], &[0u8; 10]);
        assert_checksummed(&second);

        let third = mcu.get_data();
        assert_eq!(
            &third[0..16],
            &[0x2A, 0x00, 0x05, 0x00, 0x00, 0x09, 0x31, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x02, 0x00, 0x07]
        );
        assert_eq!(&third[16..23], &UID);
        assert_checksummed(&third);

        // queue drained, back to no-response
        assert_eq!(mcu.get_data()[0], 0xFF);
    }

    #[test]
    fn test_read_gated_until_drained() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);
        read_request(&mut mcu);
        assert_eq!(mcu.response_queue.len(), 3);

        // a second read while the burst is queued is ignored
        read_request(&mut mcu);
        assert_eq!(mcu.response_queue.len(), 3);

        for _ in 0..3 {
            let _ = mcu.get_data();
        }
        read_request(&mut mcu);
        assert_eq!(mcu.response_queue.len(), 3);
    }

    fn write_fragment(seq: u8, end: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x08, seq, 0x00, end, payload.len() as u8];
        data.extend_from_slice(payload);
        data
    }

    /// Full write command: UID header, the addressed write at byte 12, then
    /// (addr, len, data) page updates from offset 22.
    fn write_command(uid: [u8; 7], pages: &[(u8, &[u8])]) -> Vec<u8> {
        let mut cmd = vec![0x00, 0x07];
        cmd.extend_from_slice(&uid);
        cmd.extend_from_slice(&[0x00; 3]); // pad to 12
        cmd.push(0x04); // addressed write target page
        cmd.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // addressed write data, [13..17]
        cmd.extend_from_slice(&[0x00; 5]); // pad to 22
        for (addr, data) in pages {
            cmd.push(*addr);
            cmd.push(data.len() as u8);
            cmd.extend_from_slice(data);
        }
        cmd.extend_from_slice(&[0x00, 0x00]); // terminator triple
        cmd
    }

    #[test]
    fn test_write_flow_applies_pages_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        std::fs::write(&path, tag_bytes()).unwrap();

        let state = Arc::new(ControllerState::new(
            ControllerKind::ProController,
            &FlashMemory::new(),
        ));
        state.set_nfc(Some(NfcTag::load_amiibo(&path).unwrap()));
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);

        // initiation with a nonzero UID
        let mut init = vec![0x06];
        init.extend_from_slice(&[0u8; 6]);
        init.extend_from_slice(&UID);
        mcu.received_11(0x02, &init);
        assert_eq!(mcu.nfc_state(), NfcState::AwaitingWrite);

        let ack = mcu.get_data();
        assert_eq!(
            &ack[0..15],
            &[0x3A, 0x00, 0x07, 0x01, 0x00, 0x08, 0x40, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x07]
        );
        assert_eq!(&ack[15..22], &UID);
        assert_eq!(&ack[22..71], &WRITE_ACK_FILLER);
        assert_checksummed(&ack);

        // fragments: page 30 gets 8 bytes of 0xAB
        let command = write_command(UID, &[(30, &[0xAB; 8])]);
        let (half1, half2) = command.split_at(command.len() / 2);
        mcu.received_11(0x02, &write_fragment(1, 0x00, half1));
        assert_eq!(mcu.nfc_state(), NfcState::Writing);
        // duplicate fragment is idempotent
        mcu.received_11(0x02, &write_fragment(1, 0x00, half1));
        mcu.received_11(0x02, &write_fragment(2, 0x08, half2));
        assert_eq!(mcu.nfc_state(), NfcState::ProcessingWrite);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[120..128], &[0xAB; 8]);
        // the addressed write landed at page 4
        assert_eq!(&on_disk[16..20], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(dir.path().join("target.bin.bak1").exists());
    }

    #[test]
    fn test_write_fragment_out_of_sequence_aborts() {
        let state = state_with_tag();
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);

        let mut init = vec![0x06];
        init.extend_from_slice(&[0u8; 6]);
        init.extend_from_slice(&UID);
        mcu.received_11(0x02, &init);
        let _ = mcu.get_data();

        mcu.received_11(0x02, &write_fragment(1, 0x00, &[0x01]));
        assert_eq!(mcu.ack_seq_no, 1);
        mcu.received_11(0x02, &write_fragment(5, 0x00, &[0x02]));
        assert_eq!(mcu.ack_seq_no, 0);
        assert!(mcu.received_data.is_empty());
        assert_eq!(mcu.nfc_state(), NfcState::AwaitingWrite);
    }

    #[test]
    fn test_removed_tag_synthesized_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tag.bin");
        std::fs::write(&path, tag_bytes()).unwrap();

        let state = Arc::new(ControllerState::new(
            ControllerKind::ProController,
            &FlashMemory::new(),
        ));
        state.set_nfc(Some(NfcTag::load_amiibo(&path).unwrap()));
        let mut mcu = nfc_configured(&state);
        mcu.received_11(0x02, &[0x01]);

        let mut init = vec![0x06];
        init.extend_from_slice(&[0u8; 6]);
        init.extend_from_slice(&UID);
        mcu.received_11(0x02, &init);
        let _ = mcu.get_data();

        let command = write_command(UID, &[(30, &[0xAB; 4])]);
        mcu.received_11(0x02, &write_fragment(1, 0x08, &command));
        let _ = mcu.get_data(); // status queued by the final fragment

        // the next status emissions present the zeroed tag
        for _ in 0..2 {
            mcu.received_11(0x02, &[0x04]);
            let frame = mcu.get_data();
            assert_eq!(&frame[16..23], &[0u8; 7]);
        }
        // once drained, the real tag is visible again
        mcu.received_11(0x02, &[0x04]);
        let _ = mcu.get_data();
        mcu.received_11(0x02, &[0x04]);
        let frame = mcu.get_data();
        assert_eq!(&frame[16..23], &UID);
    }

    #[test]
    fn test_nfc_commands_ignored_outside_nfc_mode() {
        let state = state_with_tag();
        let mut mcu = MicroControllerUnit::new(state);
        mcu.set_power_state(0x01);
        mcu.flush_response_queue();
        mcu.received_11(0x02, &[0x01]);
        assert_eq!(mcu.nfc_state(), NfcState::None);
        assert!(mcu.response_queue.is_empty());
    }
}
