//! Shared controller state: buttons, sticks and the NFC tag slot.
//!
//! External drivers (the CLI shell or a network harness) mutate this state;
//! the protocol writer loop reads it when building input reports. Mutation and
//! read never overlap a report emission: short mutex sections guard the plain
//! data, and the `send`/`input-ready` signals are broadcast watch channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;

use crate::controller::ControllerKind;
use crate::flash::{FlashMemory, StickCalibration};
use crate::nfc::NfcTag;

/// Shared, mutable handle to the currently presented amiibo.
pub type NfcHandle = Arc<Mutex<NfcTag>>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("button {0} is not available on {1}")]
    ButtonUnavailable(ButtonId, ControllerKind),
    #[error("stick value {0:#x} out of range [0, 0x1000)")]
    StickValueOutOfRange(u16),
    #[error("{0} has no {1} stick")]
    StickUnavailable(ControllerKind, &'static str),
    #[error("not connected")]
    NotConnected,
}

/// Every button any of the emulated controllers can carry.
///
/// `Sr`/`Sl` live on the side rail of either Joy-Con; their bit position
/// depends on the controller kind and the Pro Controller has neither.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ButtonId {
    Y,
    X,
    B,
    A,
    Sr,
    Sl,
    R,
    Zr,
    Minus,
    Plus,
    RStick,
    LStick,
    Home,
    Capture,
    Down,
    Up,
    Right,
    Left,
    L,
    Zl,
}

impl ButtonId {
    pub const ALL: [ButtonId; 20] = [
        ButtonId::Y,
        ButtonId::X,
        ButtonId::B,
        ButtonId::A,
        ButtonId::Sr,
        ButtonId::Sl,
        ButtonId::R,
        ButtonId::Zr,
        ButtonId::Minus,
        ButtonId::Plus,
        ButtonId::RStick,
        ButtonId::LStick,
        ButtonId::Home,
        ButtonId::Capture,
        ButtonId::Down,
        ButtonId::Up,
        ButtonId::Right,
        ButtonId::Left,
        ButtonId::L,
        ButtonId::Zl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ButtonId::Y => "y",
            ButtonId::X => "x",
            ButtonId::B => "b",
            ButtonId::A => "a",
            ButtonId::Sr => "sr",
            ButtonId::Sl => "sl",
            ButtonId::R => "r",
            ButtonId::Zr => "zr",
            ButtonId::Minus => "minus",
            ButtonId::Plus => "plus",
            ButtonId::RStick => "r_stick",
            ButtonId::LStick => "l_stick",
            ButtonId::Home => "home",
            ButtonId::Capture => "capture",
            ButtonId::Down => "down",
            ButtonId::Up => "up",
            ButtonId::Right => "right",
            ButtonId::Left => "left",
            ButtonId::L => "l",
            ButtonId::Zl => "zl",
        }
    }

    pub fn from_name(name: &str) -> Option<ButtonId> {
        ButtonId::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// `(byte index, bit mask)` in the 3-byte wire block, if the button
    /// exists on this controller kind.
    pub fn position(self, kind: ControllerKind) -> Option<(usize, u8)> {
        if !self.available_on(kind) {
            return None;
        }
        Some(match self {
            ButtonId::Y => (0, 0x01),
            ButtonId::X => (0, 0x02),
            ButtonId::B => (0, 0x04),
            ButtonId::A => (0, 0x08),
            ButtonId::Sr => match kind {
                ControllerKind::JoyconR => (0, 0x10),
                _ => (2, 0x10),
            },
            ButtonId::Sl => match kind {
                ControllerKind::JoyconR => (0, 0x20),
                _ => (2, 0x20),
            },
            ButtonId::R => (0, 0x40),
            ButtonId::Zr => (0, 0x80),
            ButtonId::Minus => (1, 0x01),
            ButtonId::Plus => (1, 0x02),
            ButtonId::RStick => (1, 0x04),
            ButtonId::LStick => (1, 0x08),
            ButtonId::Home => (1, 0x10),
            ButtonId::Capture => (1, 0x20),
            ButtonId::Down => (2, 0x01),
            ButtonId::Up => (2, 0x02),
            ButtonId::Right => (2, 0x04),
            ButtonId::Left => (2, 0x08),
            ButtonId::L => (2, 0x40),
            ButtonId::Zl => (2, 0x80),
        })
    }

    pub fn available_on(self, kind: ControllerKind) -> bool {
        match kind {
            ControllerKind::ProController => !matches!(self, ButtonId::Sr | ButtonId::Sl),
            ControllerKind::JoyconR => matches!(
                self,
                ButtonId::Y
                    | ButtonId::X
                    | ButtonId::B
                    | ButtonId::A
                    | ButtonId::Sr
                    | ButtonId::Sl
                    | ButtonId::R
                    | ButtonId::Zr
                    | ButtonId::Plus
                    | ButtonId::RStick
                    | ButtonId::Home
            ),
            ControllerKind::JoyconL => matches!(
                self,
                ButtonId::Minus
                    | ButtonId::LStick
                    | ButtonId::Capture
                    | ButtonId::Down
                    | ButtonId::Up
                    | ButtonId::Right
                    | ButtonId::Left
                    | ButtonId::Sr
                    | ButtonId::Sl
                    | ButtonId::L
                    | ButtonId::Zl
            ),
        }
    }
}

impl std::fmt::Display for ButtonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 3-byte wire-format button block for one controller kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ButtonState {
    kind: ControllerKind,
    bytes: [u8; 3],
}

impl ButtonState {
    pub fn new(kind: ControllerKind) -> Self {
        Self { kind, bytes: [0; 3] }
    }

    pub fn available_buttons(kind: ControllerKind) -> Vec<ButtonId> {
        ButtonId::ALL
            .iter()
            .copied()
            .filter(|b| b.available_on(kind))
            .collect()
    }

    pub fn set(&mut self, button: ButtonId, pressed: bool) -> Result<(), StateError> {
        let (byte, mask) = button
            .position(self.kind)
            .ok_or(StateError::ButtonUnavailable(button, self.kind))?;
        if pressed {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }
        Ok(())
    }

    pub fn get(&self, button: ButtonId) -> bool {
        match button.position(self.kind) {
            Some((byte, mask)) => self.bytes[byte] & mask != 0,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.bytes = [0; 3];
    }

    pub fn bytes(&self) -> [u8; 3] {
        self.bytes
    }
}

/// Packed neutral stick triple (h = v = 0x800).
pub const NEUTRAL_STICK_BYTES: [u8; 3] = [0x00, 0x08, 0x80];

/// One analog stick: two 12-bit axes plus the calibration used for the
/// direction presets.
#[derive(Clone, Copy, Debug)]
pub struct StickState {
    h: u16,
    v: u16,
    calibration: StickCalibration,
}

impl StickState {
    pub fn new(calibration: StickCalibration) -> Self {
        Self {
            h: calibration.h_center,
            v: calibration.v_center,
            calibration,
        }
    }

    pub fn set_h(&mut self, value: u16) -> Result<(), StateError> {
        if value >= 0x1000 {
            return Err(StateError::StickValueOutOfRange(value));
        }
        self.h = value;
        Ok(())
    }

    pub fn set_v(&mut self, value: u16) -> Result<(), StateError> {
        if value >= 0x1000 {
            return Err(StateError::StickValueOutOfRange(value));
        }
        self.v = value;
        Ok(())
    }

    pub fn h(&self) -> u16 {
        self.h
    }

    pub fn v(&self) -> u16 {
        self.v
    }

    pub fn set_center(&mut self) {
        self.h = self.calibration.h_center;
        self.v = self.calibration.v_center;
    }

    pub fn set_up(&mut self) {
        self.v = full_range(self.calibration.v_center, self.calibration.v_max_above_center, true);
    }

    pub fn set_down(&mut self) {
        self.v = full_range(self.calibration.v_center, self.calibration.v_max_below_center, false);
    }

    pub fn set_left(&mut self) {
        self.h = full_range(self.calibration.h_center, self.calibration.h_max_below_center, false);
    }

    pub fn set_right(&mut self) {
        self.h = full_range(self.calibration.h_center, self.calibration.h_max_above_center, true);
    }

    /// `[h & 0xFF, (h >> 8) | ((v & 0xF) << 4), v >> 4]`
    pub fn bytes(&self) -> [u8; 3] {
        pack_stick(self.h, self.v)
    }
}

fn full_range(center: u16, range: u16, above: bool) -> u16 {
    if above {
        (center + range).min(0xFFF)
    } else {
        center.saturating_sub(range)
    }
}

pub fn pack_stick(h: u16, v: u16) -> [u8; 3] {
    [
        (h & 0xFF) as u8,
        ((h >> 8) as u8) | (((v & 0xF) as u8) << 4),
        (v >> 4) as u8,
    ]
}

pub fn unpack_stick(bytes: [u8; 3]) -> (u16, u16) {
    let h = bytes[0] as u16 | ((bytes[1] & 0x0F) as u16) << 8;
    let v = (bytes[1] >> 4) as u16 | (bytes[2] as u16) << 4;
    (h, v)
}

/// State of the emulated controller, shared between the external driver and
/// the protocol engine.
pub struct ControllerState {
    kind: ControllerKind,
    buttons: Mutex<ButtonState>,
    l_stick: Option<Mutex<StickState>>,
    r_stick: Option<Mutex<StickState>>,
    nfc_tag: Mutex<Option<NfcHandle>>,
    connected: AtomicBool,
    /// Bumped once per successfully emitted input report.
    send_seq: watch::Sender<u64>,
    /// Set when the console issues SET_PLAYER_LIGHTS.
    input_ready: watch::Sender<bool>,
}

impl ControllerState {
    pub fn new(kind: ControllerKind, flash: &FlashMemory) -> Self {
        let l_stick = kind.has_left_stick().then(|| {
            let bytes = flash
                .user_l_stick_calibration()
                .unwrap_or_else(|| flash.factory_l_stick_calibration());
            Mutex::new(StickState::new(StickCalibration::from_l_stick_bytes(&bytes)))
        });
        let r_stick = kind.has_right_stick().then(|| {
            let bytes = flash
                .user_r_stick_calibration()
                .unwrap_or_else(|| flash.factory_r_stick_calibration());
            Mutex::new(StickState::new(StickCalibration::from_r_stick_bytes(&bytes)))
        });
        Self {
            kind,
            buttons: Mutex::new(ButtonState::new(kind)),
            l_stick,
            r_stick,
            nfc_tag: Mutex::new(None),
            connected: AtomicBool::new(false),
            send_seq: watch::channel(0).0,
            input_ready: watch::channel(false).0,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn set_button(&self, button: ButtonId, pressed: bool) -> Result<(), StateError> {
        self.buttons.lock().unwrap().set(button, pressed)
    }

    pub fn button_state(&self) -> ButtonState {
        *self.buttons.lock().unwrap()
    }

    pub fn clear_buttons(&self) {
        self.buttons.lock().unwrap().clear();
    }

    pub fn with_l_stick<R>(
        &self,
        f: impl FnOnce(&mut StickState) -> R,
    ) -> Result<R, StateError> {
        match &self.l_stick {
            Some(stick) => Ok(f(&mut stick.lock().unwrap())),
            None => Err(StateError::StickUnavailable(self.kind, "left")),
        }
    }

    pub fn with_r_stick<R>(
        &self,
        f: impl FnOnce(&mut StickState) -> R,
    ) -> Result<R, StateError> {
        match &self.r_stick {
            Some(stick) => Ok(f(&mut stick.lock().unwrap())),
            None => Err(StateError::StickUnavailable(self.kind, "right")),
        }
    }

    /// Wire bytes of the left stick; neutral center if this kind has none.
    pub fn l_stick_bytes(&self) -> [u8; 3] {
        match &self.l_stick {
            Some(stick) => stick.lock().unwrap().bytes(),
            None => NEUTRAL_STICK_BYTES,
        }
    }

    /// Wire bytes of the right stick; neutral center if this kind has none.
    pub fn r_stick_bytes(&self) -> [u8; 3] {
        match &self.r_stick {
            Some(stick) => stick.lock().unwrap().bytes(),
            None => NEUTRAL_STICK_BYTES,
        }
    }

    pub fn set_nfc(&self, tag: Option<NfcTag>) {
        *self.nfc_tag.lock().unwrap() = tag.map(|t| Arc::new(Mutex::new(t)));
    }

    pub fn nfc(&self) -> Option<NfcHandle> {
        self.nfc_tag.lock().unwrap().clone()
    }

    // --- signals, driven by the protocol engine ---

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Tears down the send synchronization: wakes all `send()` and
    /// `connect()` waiters, which then observe the disconnect.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.send_seq.send_modify(|seq| *seq += 1);
        self.input_ready.send_modify(|_| {});
    }

    /// Called by the writer loop after every successful report emission.
    pub fn notify_sent(&self) {
        self.send_seq.send_modify(|seq| *seq += 1);
    }

    pub fn set_input_ready(&self) {
        self.input_ready.send_replace(true);
    }

    /// Waits until the state has been reflected in an emitted input report.
    pub async fn send(&self) -> Result<(), StateError> {
        if !self.is_connected() {
            return Err(StateError::NotConnected);
        }
        let mut seq = self.send_seq.subscribe();
        seq.changed().await.map_err(|_| StateError::NotConnected)?;
        if !self.is_connected() {
            return Err(StateError::NotConnected);
        }
        Ok(())
    }

    /// Waits until the console has finished configuring the controller and
    /// accepts button input. Fails if the transport tears down first.
    pub async fn connect(&self) -> Result<(), StateError> {
        let mut ready = self.input_ready.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if !self.is_connected() {
                return Err(StateError::NotConnected);
            }
            ready.changed().await.map_err(|_| StateError::NotConnected)?;
        }
    }
}
