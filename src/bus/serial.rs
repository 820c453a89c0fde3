//! `serialport`-backed transport for real hardware.

use super::BusTransport;
use crate::error::{SpimError, SpimResult};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

/// Serial transport speaking newline-delimited ASCII.
pub struct SerialTransport {
    device: String,
    port_name: String,
    baud_rate: u32,
    /// Response line ending; responses accumulate until this byte arrives.
    response_delimiter: u8,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Describe a port without opening it.
    pub fn new(device: impl Into<String>, port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            port_name: port_name.into(),
            baud_rate,
            response_delimiter: b'\n',
            port: None,
        }
    }

    /// Override the response delimiter (default `\n`).
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

impl BusTransport for SerialTransport {
    fn open(&mut self) -> SpimResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        // short internal timeout; read_line enforces the overall deadline
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|err| SpimError::Connectivity {
                device: self.device.clone(),
                port: self.port_name.clone(),
                reason: err.to_string(),
            })?;
        debug!(device = %self.device, port = %self.port_name, baud = self.baud_rate, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(device = %self.device, port = %self.port_name, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> SpimResult<()> {
        let port = self.port.as_mut().ok_or(SpimError::NotOpen)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> SpimResult<String> {
        let delimiter = self.response_delimiter;
        let port = self.port.as_mut().ok_or(SpimError::NotOpen)?;
        let start = Instant::now();
        let mut response = Vec::new();
        let mut buffer = [0u8; 1];

        loop {
            if start.elapsed() > timeout {
                return Err(SpimError::ReadTimeout(timeout));
            }
            match port.read(&mut buffer) {
                Ok(0) => {
                    // EOF should not happen on a serial port
                    return Err(SpimError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "unexpected EOF from serial port",
                    )));
                }
                Ok(_) => {
                    response.push(buffer[0]);
                    if buffer[0] == delimiter {
                        break;
                    }
                }
                // the port timeout is shorter than the overall deadline
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(err) => return Err(SpimError::Io(err)),
            }
        }

        Ok(String::from_utf8_lossy(&response).to_string())
    }

    fn flush_input(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(serialport::ClearBuffer::Input);
        }
    }
}
