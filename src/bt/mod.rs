//! Bluetooth-facing half of the emulator: adapter control, HID server
//! bootstrap, the L2CAP transport and the HID protocol engine.

pub mod adapter;
pub mod hci;
pub mod protocol;
pub mod server;
pub mod transport;
