//! Serial line settings and how to open them.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_serial::{DataBits, FlowControl, SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::error::{Error, Result};

/// Standard rates accepted for a serial line.
pub const BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000,
    3000000, 3500000, 4000000,
];

/// Short timeout so a blocked read never hides the stop signal for long.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

impl Parity {
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }

    pub fn from_letter(letter: &str) -> Option<Parity> {
        match letter.to_ascii_uppercase().as_str() {
            "N" => Some(Parity::None),
            "E" => Some(Parity::Even),
            "O" => Some(Parity::Odd),
            "M" => Some(Parity::Mark),
            "S" => Some(Parity::Space),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub fn parse(value: &str) -> Option<StopBits> {
        match value {
            "1" => Some(StopBits::One),
            "1.5" => Some(StopBits::OnePointFive),
            "2" => Some(StopBits::Two),
            _ => None,
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => write!(f, "1"),
            StopBits::OnePointFive => write!(f, "1.5"),
            StopBits::Two => write!(f, "2"),
        }
    }
}

/// Parameters of a serial line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub byte_size: u8,
    pub rtscts: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            port: String::new(),
            baudrate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            byte_size: 8,
            rtscts: false,
        }
    }
}

impl SerialSettings {
    pub fn new(port: &str, baudrate: u32) -> SerialSettings {
        SerialSettings {
            port: port.to_string(),
            baudrate,
            ..Default::default()
        }
    }

    /// Checks the parameters without touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::MissingSettings("serial port name is not set".into()));
        }
        if !BAUD_RATES.contains(&self.baudrate) {
            return Err(Error::Settings(format!(
                "{} is not a standard baud rate",
                self.baudrate
            )));
        }
        if !(5..=8).contains(&self.byte_size) {
            return Err(Error::Settings(format!(
                "byte size must be between 5 and 8, got {}",
                self.byte_size
            )));
        }
        Ok(())
    }

    /// Opens the port exclusively.
    pub fn connect(&self) -> Result<SerialStream> {
        self.validate()?;

        let data_bits = match self.byte_size {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(Error::Settings(format!(
                    "parity {:?} is not supported by the serial backend",
                    self.parity
                )))
            }
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::Settings(
                    "1.5 stop bits are not supported by the serial backend".into(),
                ))
            }
        };
        let flow_control = if self.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };

        #[allow(unused_mut)]
        let mut port = tokio_serial::new(self.port.clone(), self.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(SERIAL_READ_TIMEOUT)
            .open_native_async()
            .map_err(|e| self.open_error(e))?;

        #[cfg(unix)]
        port.set_exclusive(true).map_err(|e| self.open_error(e))?;

        info!("Opened serial port {} at {} baud.", self.port, self.baudrate);
        Ok(port)
    }

    fn open_error(&self, err: tokio_serial::Error) -> Error {
        let description = err.description.to_ascii_lowercase();
        match err.kind {
            _ if description.contains("busy") || description.contains("in use") => {
                Error::PortInUse(self.port.clone())
            }
            tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Error::PortInUse(self.port.clone())
            }
            tokio_serial::ErrorKind::NoDevice
            | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
                Error::PortNotFound(self.port.clone())
            }
            _ => Error::Settings(format!("{}: {}", self.port, err.description)),
        }
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Serial {} {} {}{}{}",
            self.port,
            self.baudrate,
            self.byte_size,
            self.parity.letter(),
            self.stop_bits
        )?;
        if self.rtscts {
            write!(f, " RTS/CTS")?;
        }
        Ok(())
    }
}
