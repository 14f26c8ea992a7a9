//! HID report codec.
//!
//! Input reports (emulator -> console) are built in a fixed 363-byte buffer
//! prefixed with 0xA1 and trimmed to the report-ID-specific wire length on
//! emission. Output reports (console -> emulator) are prefixed with 0xA2.
//! Byte offsets follow the Switch bluetooth HID report layout:
//! https://github.com/dekuNukem/Nintendo_Switch_Reverse_Engineering/blob/master/bluetooth_hid_notes.md

use thiserror::Error;

use crate::controller::ControllerKind;

/// Firmware version reported in the device-info reply.
pub const FIRMWARE_VERSION: [u8; 2] = [0x04, 0x00];

/// Battery level + connection info byte.
const BATTERY_CONNECTION: u8 = 0x8E;

/// MCU payload carried by 0x31 reports.
pub const MCU_PAYLOAD_SIZE: usize = 313;

/// Largest SPI flash slice a single read reply can carry.
const MAX_SPI_READ: usize = 0x1D;

/// Unexplained constants of the pre-pairing 0x3F report; retained verbatim.
const SIMPLE_REPORT_HEADER: [u8; 3] = [0x28, 0xCA, 0x08];
const SIMPLE_REPORT_STICKS: [u8; 8] = [0x40, 0x8A, 0x4F, 0x8A, 0xD0, 0x7E, 0xDF, 0x7F];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report too short ({0} bytes)")]
    TooShort(usize),
    #[error("output reports must start with 0xA2, got {0:#04x}")]
    BadMagic(u8),
    #[error("unknown input report id {0:#04x}")]
    UnknownReportId(u8),
    #[error("spi read of {0:#x} bytes exceeds the {MAX_SPI_READ:#x} byte reply limit")]
    SpiReadTooLarge(usize),
    #[error("trigger elapsed time {0} ms does not fit the wire format")]
    ElapsedTimeTooLarge(u64),
}

/// Wire length of an input report, including the leading 0xA1.
pub fn input_report_length(id: u8) -> Result<usize, ReportError> {
    match id {
        0x21 => Ok(51),
        0x30 => Ok(14),
        0x31 => Ok(363),
        0x3F => Ok(11),
        other => Err(ReportError::UnknownReportId(other)),
    }
}

/// CRC-8, polynomial 0x07, seed 0. Closes every 313-byte MCU payload.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Outgoing input report under construction.
pub struct InputReport {
    data: [u8; 363],
}

impl InputReport {
    pub fn new() -> Self {
        let mut data = [0u8; 363];
        data[0] = 0xA1;
        Self { data }
    }

    pub fn set_report_id(&mut self, id: u8) {
        self.data[1] = id;
    }

    pub fn report_id(&self) -> u8 {
        self.data[1]
    }

    pub fn set_timer(&mut self, timer: u8) {
        self.data[2] = timer;
    }

    pub fn set_misc(&mut self) {
        self.data[3] = BATTERY_CONNECTION;
    }

    pub fn set_button_status(&mut self, buttons: [u8; 3]) {
        self.data[4..7].copy_from_slice(&buttons);
    }

    pub fn button_status(&self) -> [u8; 3] {
        [self.data[4], self.data[5], self.data[6]]
    }

    pub fn set_stick_status(&mut self, l_stick: [u8; 3], r_stick: [u8; 3]) {
        self.data[7..10].copy_from_slice(&l_stick);
        self.data[10..13].copy_from_slice(&r_stick);
    }

    pub fn set_vibrator_input(&mut self) {
        self.data[13] = 0x80;
    }

    /// No sensor fusion: the 6-axis block stays zeroed.
    pub fn set_6axis_data(&mut self) {
        self.data[14..50].fill(0x00);
    }

    /// Fixed header and nominal-stick constants of the pre-pairing report.
    pub fn set_simple_report_constants(&mut self) {
        self.data[2..5].copy_from_slice(&SIMPLE_REPORT_HEADER);
        self.data[5..13].copy_from_slice(&SIMPLE_REPORT_STICKS);
    }

    /// ACK byte of a sub-command reply.
    pub fn set_ack(&mut self, ack: u8) {
        self.data[14] = ack;
    }

    pub fn ack(&self) -> u8 {
        self.data[14]
    }

    /// Sub-command ID being acknowledged.
    pub fn reply_to_subcommand_id(&mut self, id: u8) {
        self.data[15] = id;
    }

    pub fn replied_subcommand_id(&self) -> u8 {
        self.data[15]
    }

    /// Sub-command reply payload area of a 0x21 report.
    pub fn subcommand_reply_data(&self) -> &[u8] {
        &self.data[16..51]
    }

    /// Device-info reply. `mac` is the adapter address in big-endian order.
    pub fn sub_0x02_device_info(&mut self, mac: [u8; 6], kind: ControllerKind) {
        self.reply_to_subcommand_id(0x02);
        self.data[16..18].copy_from_slice(&FIRMWARE_VERSION);
        self.data[18] = kind.id();
        self.data[19] = 0x02;
        self.data[20..26].copy_from_slice(&mac);
        self.data[26] = 0x01;
        self.data[27] = 0x01;
    }

    /// SPI flash read reply: little-endian offset, size, then the data.
    pub fn sub_0x10_spi_flash_read(&mut self, offset: u32, data: &[u8]) -> Result<(), ReportError> {
        if data.len() > MAX_SPI_READ {
            return Err(ReportError::SpiReadTooLarge(data.len()));
        }
        self.reply_to_subcommand_id(0x10);
        self.data[16..20].copy_from_slice(&offset.to_le_bytes());
        self.data[20] = data.len() as u8;
        self.data[21..21 + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Trigger-buttons elapsed time reply: seven u16le values of `ms / 10`
    /// for L, R, ZL, ZR, SL, SR, HOME.
    pub fn sub_0x04_trigger_buttons_elapsed_time(
        &mut self,
        times_ms: TriggerButtonTimes,
    ) -> Result<(), ReportError> {
        self.reply_to_subcommand_id(0x04);
        for (i, ms) in times_ms.wire_order().into_iter().enumerate() {
            let ticks = ms / 10;
            let ticks = u16::try_from(ticks).map_err(|_| ReportError::ElapsedTimeTooLarge(ms))?;
            self.data[16 + 2 * i..18 + 2 * i].copy_from_slice(&ticks.to_le_bytes());
        }
        Ok(())
    }

    /// Fixed 34-byte SET_NFC_IR_MCU_CONFIG reply payload; the final byte is
    /// the CRC-8 of the preceding 33 (which happens to be 0xC8).
    pub fn sub_0x21_set_mcu_config(&mut self) {
        self.reply_to_subcommand_id(0x21);
        self.data[16..24].copy_from_slice(&[0x01, 0x00, 0xFF, 0x00, 0x08, 0x00, 0x1B, 0x01]);
        self.data[24..49].fill(0x00);
        self.data[49] = crc8(&self.data[16..49]);
    }

    /// 313-byte MCU payload of a 0x31 report.
    pub fn set_mcu_data(&mut self, data: &[u8; MCU_PAYLOAD_SIZE]) {
        self.data[50..363].copy_from_slice(data);
    }

    pub fn mcu_data(&self) -> &[u8] {
        &self.data[50..363]
    }

    /// Wire bytes, trimmed to the length the report ID dictates.
    pub fn as_bytes(&self) -> Result<&[u8], ReportError> {
        let len = input_report_length(self.report_id())?;
        Ok(&self.data[..len])
    }
}

impl Default for InputReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-trigger hold durations in milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct TriggerButtonTimes {
    pub l: u64,
    pub r: u64,
    pub zl: u64,
    pub zr: u64,
    pub sl: u64,
    pub sr: u64,
    pub home: u64,
}

impl TriggerButtonTimes {
    /// Pairing hack: report long trigger holds so the console assigns a
    /// player slot.
    pub fn pairing(kind: ControllerKind) -> Self {
        match kind {
            ControllerKind::ProController => Self {
                l: 3000,
                r: 3000,
                ..Self::default()
            },
            ControllerKind::JoyconL | ControllerKind::JoyconR => Self {
                sl: 3000,
                sr: 3000,
                ..Self::default()
            },
        }
    }

    fn wire_order(self) -> [u64; 7] {
        [self.l, self.r, self.zl, self.zr, self.sl, self.sr, self.home]
    }
}

/// Sub-commands nested in 0x01 output reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubCommand {
    RequestDeviceInfo,
    SetInputReportMode,
    TriggerButtonsElapsedTime,
    SetShipmentState,
    SpiFlashRead,
    SetNfcIrMcuConfig,
    SetNfcIrMcuState,
    SetPlayerLights,
    Enable6AxisSensor,
    EnableVibration,
    Unknown(u8),
}

impl SubCommand {
    pub fn from_byte(byte: u8) -> SubCommand {
        match byte {
            0x02 => SubCommand::RequestDeviceInfo,
            0x03 => SubCommand::SetInputReportMode,
            0x04 => SubCommand::TriggerButtonsElapsedTime,
            0x08 => SubCommand::SetShipmentState,
            0x10 => SubCommand::SpiFlashRead,
            0x21 => SubCommand::SetNfcIrMcuConfig,
            0x22 => SubCommand::SetNfcIrMcuState,
            0x30 => SubCommand::SetPlayerLights,
            0x40 => SubCommand::Enable6AxisSensor,
            0x48 => SubCommand::EnableVibration,
            other => SubCommand::Unknown(other),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            SubCommand::RequestDeviceInfo => 0x02,
            SubCommand::SetInputReportMode => 0x03,
            SubCommand::TriggerButtonsElapsedTime => 0x04,
            SubCommand::SetShipmentState => 0x08,
            SubCommand::SpiFlashRead => 0x10,
            SubCommand::SetNfcIrMcuConfig => 0x21,
            SubCommand::SetNfcIrMcuState => 0x22,
            SubCommand::SetPlayerLights => 0x30,
            SubCommand::Enable6AxisSensor => 0x40,
            SubCommand::EnableVibration => 0x48,
            SubCommand::Unknown(other) => other,
        }
    }
}

/// Output report kinds the console sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputReportId {
    /// 0x01: rumble data plus a sub-command.
    SubCommand,
    /// 0x10: rumble only.
    RumbleOnly,
    /// 0x11: request to the NFC/IR MCU.
    RequestMcu,
    Unknown(u8),
}

impl OutputReportId {
    pub fn from_byte(byte: u8) -> OutputReportId {
        match byte {
            0x01 => OutputReportId::SubCommand,
            0x10 => OutputReportId::RumbleOnly,
            0x11 => OutputReportId::RequestMcu,
            other => OutputReportId::Unknown(other),
        }
    }
}

/// Parsed view of a received output report.
pub struct OutputReport {
    data: Vec<u8>,
}

impl OutputReport {
    pub fn parse(data: &[u8]) -> Result<Self, ReportError> {
        if data.is_empty() {
            return Err(ReportError::TooShort(0));
        }
        if data[0] != 0xA2 {
            return Err(ReportError::BadMagic(data[0]));
        }
        if data.len() < 12 {
            return Err(ReportError::TooShort(data.len()));
        }
        Ok(Self { data: data.to_vec() })
    }

    pub fn report_id(&self) -> OutputReportId {
        OutputReportId::from_byte(self.data[1])
    }

    /// Sub-command ID; for 0x11 reports this is the MCU sub-command.
    pub fn sub_command(&self) -> u8 {
        self.data[11]
    }

    pub fn sub_command_data(&self) -> &[u8] {
        &self.data[12..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_known_vectors() {
        assert_eq!(crc8(&[]), 0x00);
        // the MCU-config reply tail
        let mut config = vec![0x01, 0x00, 0xFF, 0x00, 0x08, 0x00, 0x1B, 0x01];
        config.resize(33, 0x00);
        assert_eq!(crc8(&config), 0xC8);
        // the cached no-response frame
        let mut no_response = vec![0xFF];
        no_response.resize(312, 0x00);
        assert_eq!(crc8(&no_response), 0x6F);
    }

    #[test]
    fn test_report_lengths() {
        assert_eq!(input_report_length(0x21).unwrap(), 51);
        assert_eq!(input_report_length(0x30).unwrap(), 14);
        assert_eq!(input_report_length(0x31).unwrap(), 363);
        assert_eq!(input_report_length(0x3F).unwrap(), 11);
        assert!(input_report_length(0x32).is_err());
    }

    #[test]
    fn test_standard_report_layout() {
        let mut report = InputReport::new();
        report.set_report_id(0x30);
        report.set_timer(0x42);
        report.set_misc();
        report.set_button_status([0x01, 0x02, 0x03]);
        report.set_stick_status([0x00, 0x08, 0x80], [0x11, 0x22, 0x33]);
        report.set_vibrator_input();

        let bytes = report.as_bytes().unwrap();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[0], 0xA1);
        assert_eq!(bytes[1], 0x30);
        assert_eq!(bytes[2], 0x42);
        assert_eq!(bytes[3], 0x8E);
        assert_eq!(&bytes[4..7], &[0x01, 0x02, 0x03]);
        assert_eq!(&bytes[7..10], &[0x00, 0x08, 0x80]);
        assert_eq!(&bytes[10..13], &[0x11, 0x22, 0x33]);
        assert_eq!(bytes[13], 0x80);
    }

    #[test]
    fn test_simple_report_bytes() {
        let mut report = InputReport::new();
        report.set_report_id(0x3F);
        report.set_simple_report_constants();
        let bytes = report.as_bytes().unwrap();
        assert_eq!(
            bytes,
            &[0xA1, 0x3F, 0x28, 0xCA, 0x08, 0x40, 0x8A, 0x4F, 0x8A, 0xD0, 0x7E]
        );
    }

    #[test]
    fn test_device_info_reply() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report.set_ack(0x82);
        report.sub_0x02_device_info(
            [0xDC, 0xA6, 0x32, 0x71, 0x58, 0xBB],
            ControllerKind::ProController,
        );
        let bytes = report.as_bytes().unwrap();
        assert_eq!(bytes.len(), 51);
        assert_eq!(bytes[14], 0x82);
        assert_eq!(bytes[15], 0x02);
        assert_eq!(&bytes[16..18], &[0x04, 0x00]);
        assert_eq!(bytes[18], 0x03);
        assert_eq!(bytes[19], 0x02);
        assert_eq!(&bytes[20..26], &[0xDC, 0xA6, 0x32, 0x71, 0x58, 0xBB]);
        assert_eq!(bytes[26], 0x01);
        assert_eq!(bytes[27], 0x01);
    }

    #[test]
    fn test_spi_flash_read_reply() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report.set_ack(0x90);
        let data = [0x00, 0x07, 0x70, 0x00, 0x08, 0x80, 0x00, 0x07, 0x70];
        report.sub_0x10_spi_flash_read(0x603D, &data).unwrap();
        let bytes = report.as_bytes().unwrap();
        assert_eq!(&bytes[16..20], &[0x3D, 0x60, 0x00, 0x00]);
        assert_eq!(bytes[20], 9);
        assert_eq!(&bytes[21..30], &data);
    }

    #[test]
    fn test_spi_flash_read_reply_size_limit() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        assert!(report.sub_0x10_spi_flash_read(0, &[0u8; 0x1D]).is_ok());
        assert!(matches!(
            report.sub_0x10_spi_flash_read(0, &[0u8; 0x1E]),
            Err(ReportError::SpiReadTooLarge(0x1E))
        ));
    }

    #[test]
    fn test_trigger_elapsed_time_pairing_values() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report
            .sub_0x04_trigger_buttons_elapsed_time(TriggerButtonTimes::pairing(
                ControllerKind::ProController,
            ))
            .unwrap();
        let bytes = report.as_bytes().unwrap();
        // 3000 ms / 10 = 300 = 0x012C, little endian, in slots L and R
        assert_eq!(&bytes[16..18], &[0x2C, 0x01]);
        assert_eq!(&bytes[18..20], &[0x2C, 0x01]);
        assert_eq!(&bytes[20..30], &[0x00; 10]);

        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report
            .sub_0x04_trigger_buttons_elapsed_time(TriggerButtonTimes::pairing(
                ControllerKind::JoyconR,
            ))
            .unwrap();
        let bytes = report.as_bytes().unwrap();
        // SL and SR are the fifth and sixth slot
        assert_eq!(&bytes[24..26], &[0x2C, 0x01]);
        assert_eq!(&bytes[26..28], &[0x2C, 0x01]);
    }

    #[test]
    fn test_trigger_elapsed_time_overflow() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        let times = TriggerButtonTimes {
            home: 10 * 0xFFFF as u64,
            ..TriggerButtonTimes::default()
        };
        assert!(report.sub_0x04_trigger_buttons_elapsed_time(times).is_ok());
        let times = TriggerButtonTimes {
            home: 10 * 0xFFFF as u64 + 10,
            ..TriggerButtonTimes::default()
        };
        assert!(matches!(
            report.sub_0x04_trigger_buttons_elapsed_time(times),
            Err(ReportError::ElapsedTimeTooLarge(_))
        ));
    }

    #[test]
    fn test_mcu_config_reply_checksum() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report.set_ack(0xA0);
        report.sub_0x21_set_mcu_config();
        let bytes = report.as_bytes().unwrap();
        assert_eq!(&bytes[16..24], &[0x01, 0x00, 0xFF, 0x00, 0x08, 0x00, 0x1B, 0x01]);
        assert_eq!(bytes[49], 0xC8);
        assert_eq!(bytes[49], crc8(&bytes[16..49]));
    }

    #[test]
    fn test_mcu_data_placement() {
        let mut report = InputReport::new();
        report.set_report_id(0x31);
        let mut payload = [0u8; MCU_PAYLOAD_SIZE];
        payload[0] = 0xAA;
        payload[312] = 0x55;
        report.set_mcu_data(&payload);
        let bytes = report.as_bytes().unwrap();
        assert_eq!(bytes.len(), 363);
        assert_eq!(bytes[50], 0xAA);
        assert_eq!(bytes[362], 0x55);
    }

    #[test]
    fn test_subcommand_reply_roundtrip() {
        let mut report = InputReport::new();
        report.set_report_id(0x21);
        report.set_ack(0x80);
        report.reply_to_subcommand_id(0x03);
        assert_eq!(report.ack(), 0x80);
        assert_eq!(report.replied_subcommand_id(), 0x03);
        assert_eq!(report.as_bytes().unwrap()[15], 0x03);
    }

    #[test]
    fn test_output_report_parsing() {
        let mut raw = vec![0u8; 50];
        raw[0] = 0xA2;
        raw[1] = 0x01;
        raw[11] = 0x10;
        raw[12..17].copy_from_slice(&[0x3D, 0x60, 0x00, 0x00, 0x09]);
        let report = OutputReport::parse(&raw).unwrap();
        assert_eq!(report.report_id(), OutputReportId::SubCommand);
        assert_eq!(report.sub_command(), 0x10);
        assert_eq!(&report.sub_command_data()[..5], &[0x3D, 0x60, 0x00, 0x00, 0x09]);
    }

    #[test]
    fn test_output_report_rejects_bad_frames() {
        assert!(matches!(OutputReport::parse(&[]), Err(ReportError::TooShort(0))));
        assert!(matches!(
            OutputReport::parse(&[0xA1, 0x01]),
            Err(ReportError::BadMagic(0xA1))
        ));
        let mut raw = vec![0u8; 8];
        raw[0] = 0xA2;
        assert!(matches!(OutputReport::parse(&raw), Err(ReportError::TooShort(8))));
    }

    #[test]
    fn test_subcommand_classification() {
        assert_eq!(SubCommand::from_byte(0x02), SubCommand::RequestDeviceInfo);
        assert_eq!(SubCommand::from_byte(0x30), SubCommand::SetPlayerLights);
        assert_eq!(SubCommand::from_byte(0x33), SubCommand::Unknown(0x33));
        for byte in [0x02u8, 0x03, 0x04, 0x08, 0x10, 0x21, 0x22, 0x30, 0x40, 0x48] {
            assert_eq!(SubCommand::from_byte(byte).id(), byte);
        }
    }
}
