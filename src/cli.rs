//! Interactive controller shell.
//!
//! Line-oriented: `&&` chains commands, any available button name is itself a
//! command (press for 0.1 s, release), and a handful of verbs drive sticks,
//! the NFC reader and test helpers. The shell blocks on `state.send()` after
//! every mutation, so each line is reflected on the wire before the next
//! prompt.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;

use crate::nfc::NfcTag;
use crate::state::{ButtonId, ButtonState, ControllerState, StateError, StickState};

/// Hold time of a plain button press.
const PUSH_DURATION: Duration = Duration::from_millis(100);

/// Presses the given buttons together, waits, releases them.
pub async fn button_push(
    state: &ControllerState,
    buttons: &[ButtonId],
    hold: Duration,
) -> Result<(), StateError> {
    for &button in buttons {
        state.set_button(button, true)?;
    }
    state.send().await?;
    tokio::time::sleep(hold).await;
    for &button in buttons {
        state.set_button(button, false)?;
    }
    state.send().await
}

pub struct ControllerCli {
    state: Arc<ControllerState>,
}

impl ControllerCli {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    /// Runs until `exit`, end of input, or a lost connection.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("cmd >> ");
            std::io::stdout().flush().ok();
            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut buttons_to_push = Vec::new();
            for command in line.split("&&") {
                let mut tokens = command.split_whitespace();
                let Some(cmd) = tokens.next() else {
                    continue;
                };
                let args: Vec<&str> = tokens.collect();

                match cmd {
                    "exit" => return Ok(()),
                    "help" => self.print_help(),
                    "stick" => match self.cmd_stick(&args) {
                        Ok(message) => println!("{message}"),
                        Err(err) => println!("{err}"),
                    },
                    "nfc" => {
                        if let Err(err) = self.cmd_nfc(&args) {
                            println!("{err}");
                        }
                    }
                    "hold" => self.set_buttons(&args, true),
                    "release" => self.set_buttons(&args, false),
                    "test_buttons" => {
                        if self.test_buttons().await.is_err() {
                            info!("[CLI] connection was lost");
                            return Ok(());
                        }
                    }
                    "mash" => match self.cmd_mash(&args, &mut lines).await {
                        Ok(()) => {}
                        Err(StateError::NotConnected) => {
                            info!("[CLI] connection was lost");
                            return Ok(());
                        }
                        Err(err) => println!("{err}"),
                    },
                    name => match ButtonId::from_name(name) {
                        Some(button) => buttons_to_push.push(button),
                        None => println!("command {name} not found, call help for help."),
                    },
                }
            }

            let result = if buttons_to_push.is_empty() {
                self.state.send().await
            } else {
                button_push(&self.state, &buttons_to_push, PUSH_DURATION).await
            };
            match result {
                Ok(()) => {}
                Err(StateError::NotConnected) => {
                    info!("[CLI] connection was lost");
                    return Ok(());
                }
                Err(err) => println!("{err}"),
            }
        }
    }

    fn print_help(&self) {
        let buttons: Vec<&str> = ButtonState::available_buttons(self.state.kind())
            .into_iter()
            .map(ButtonId::name)
            .collect();
        println!("Buttons can be used as commands: {}", buttons.join(", "));
        println!("stick <l|r> <center|up|down|left|right|h|v> [value] - set stick position");
        println!("nfc <path>|remove - present or remove an amiibo");
        println!("hold <buttons...> - keep buttons pressed");
        println!("release <buttons...> - release held buttons");
        println!("mash <button> <interval-ms> - mash until the next input line");
        println!("test_buttons - push every available button once");
        println!("Commands can be chained using \"&&\"");
        println!("Type \"exit\" to close.");
    }

    fn cmd_stick(&self, args: &[&str]) -> Result<String, StateError> {
        let (Some(&side), Some(&direction)) = (args.first(), args.get(1)) else {
            return Ok("usage: stick <l|r> <direction> [value]".into());
        };
        if !matches!(
            direction,
            "center" | "up" | "down" | "left" | "right" | "h" | "horizontal" | "v" | "vertical"
        ) {
            return Ok(format!("unexpected argument \"{direction}\""));
        }
        let value = match args.get(2) {
            Some(raw) => match raw.parse::<u16>() {
                Ok(value) => Some(value),
                Err(_) => return Ok(format!("unexpected stick value \"{raw}\"")),
            },
            None => None,
        };
        if matches!(direction, "h" | "horizontal" | "v" | "vertical") && value.is_none() {
            return Ok("missing stick value".into());
        }

        let apply = |stick: &mut StickState| -> Result<(u16, u16), StateError> {
            match direction {
                "center" => stick.set_center(),
                "up" => stick.set_up(),
                "down" => stick.set_down(),
                "left" => stick.set_left(),
                "right" => stick.set_right(),
                "h" | "horizontal" => stick.set_h(value.unwrap_or_default())?,
                _ => stick.set_v(value.unwrap_or_default())?,
            }
            Ok((stick.h(), stick.v()))
        };

        let (h, v) = match side {
            "l" | "left" => self.state.with_l_stick(apply)??,
            "r" | "right" => self.state.with_r_stick(apply)??,
            _ => return Ok("side must be \"l\", \"left\", \"r\" or \"right\"".into()),
        };
        Ok(format!("{side} stick set to ({h:#05x}, {v:#05x})"))
    }

    fn cmd_nfc(&self, args: &[&str]) -> anyhow::Result<()> {
        match args.first() {
            Some(&"remove") => {
                self.state.set_nfc(None);
                println!("amiibo removed");
            }
            Some(path) => {
                let tag = NfcTag::load_amiibo(Path::new(path))?;
                println!("amiibo {path} loaded (uid {:02X?})", tag.uid());
                self.state.set_nfc(Some(tag));
            }
            None => println!("usage: nfc <path>|remove"),
        }
        Ok(())
    }

    fn set_buttons(&self, names: &[&str], pressed: bool) {
        for &name in names {
            match ButtonId::from_name(name) {
                Some(button) => {
                    if let Err(err) = self.state.set_button(button, pressed) {
                        println!("{err}");
                    }
                }
                None => println!("unknown button \"{name}\""),
            }
        }
    }

    async fn test_buttons(&self) -> Result<(), StateError> {
        for button in ButtonState::available_buttons(self.state.kind()) {
            println!("pushing {button}...");
            button_push(&self.state, &[button], PUSH_DURATION).await?;
        }
        Ok(())
    }

    /// Mashes one button at a fixed interval until the next input line.
    async fn cmd_mash(
        &self,
        args: &[&str],
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> Result<(), StateError> {
        let (Some(&name), Some(interval)) = (args.first(), args.get(1)) else {
            println!("usage: mash <button> <interval-ms>");
            return Ok(());
        };
        let Some(button) = ButtonId::from_name(name) else {
            println!("unknown button \"{name}\"");
            return Ok(());
        };
        let Ok(interval) = interval.parse::<u64>() else {
            println!("unexpected interval \"{interval}\"");
            return Ok(());
        };

        println!("mashing {button} every {interval} ms; press enter to stop");
        let mut ticker = tokio::time::interval(Duration::from_millis(interval.max(1)));
        loop {
            tokio::select! {
                _ = lines.next_line() => {
                    self.state.set_button(button, false)?;
                    return self.state.send().await;
                }
                _ = ticker.tick() => {
                    self.state.set_button(button, true)?;
                    self.state.send().await?;
                    self.state.set_button(button, false)?;
                    self.state.send().await?;
                }
            }
        }
    }
}
