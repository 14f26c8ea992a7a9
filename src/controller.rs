//! Emulated controller kinds.

use std::fmt;
use std::str::FromStr;

/// Which Switch controller we present ourselves as.
///
/// The discriminants are the values the console expects in the device-info
/// sub-command reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControllerKind {
    JoyconL = 0x01,
    JoyconR = 0x02,
    ProController = 0x03,
}

impl ControllerKind {
    /// Bluetooth device name the console matches against.
    pub fn device_name(self) -> &'static str {
        match self {
            ControllerKind::JoyconL => "Joy-Con (L)",
            ControllerKind::JoyconR => "Joy-Con (R)",
            ControllerKind::ProController => "Pro Controller",
        }
    }

    /// Byte used in the device-info reply.
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn has_left_stick(self) -> bool {
        matches!(self, ControllerKind::JoyconL | ControllerKind::ProController)
    }

    pub fn has_right_stick(self) -> bool {
        matches!(self, ControllerKind::JoyconR | ControllerKind::ProController)
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_name())
    }
}

impl FromStr for ControllerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JOYCON_L" => Ok(ControllerKind::JoyconL),
            "JOYCON_R" => Ok(ControllerKind::JoyconR),
            "PRO_CONTROLLER" => Ok(ControllerKind::ProController),
            _ => Err(format!("unknown controller \"{s}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(ControllerKind::JoyconL.device_name(), "Joy-Con (L)");
        assert_eq!(ControllerKind::JoyconR.device_name(), "Joy-Con (R)");
        assert_eq!(ControllerKind::ProController.device_name(), "Pro Controller");
    }

    #[test]
    fn test_from_arg() {
        assert_eq!(
            "PRO_CONTROLLER".parse::<ControllerKind>().unwrap(),
            ControllerKind::ProController
        );
        assert_eq!(
            "joycon_l".parse::<ControllerKind>().unwrap(),
            ControllerKind::JoyconL
        );
        assert!("procon".parse::<ControllerKind>().is_err());
    }

    #[test]
    fn test_stick_presence() {
        assert!(ControllerKind::ProController.has_left_stick());
        assert!(ControllerKind::ProController.has_right_stick());
        assert!(ControllerKind::JoyconL.has_left_stick());
        assert!(!ControllerKind::JoyconL.has_right_stick());
        assert!(!ControllerKind::JoyconR.has_left_stick());
        assert!(ControllerKind::JoyconR.has_right_stick());
    }
}
