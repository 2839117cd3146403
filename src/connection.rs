//! Serial connection to a device in ROM bootloader mode
//!
//! [`Connection`] owns the serial port for its whole lifetime: opening it
//! runs the enter-bootloader reset choreography, dropping it hard-resets the
//! chip back into the application. In between, [`Connection::transceive`]
//! runs the write/read/timeout/retry cycle for one command at a time.

use std::{
    io::{self, Read, Write},
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    command::Command,
    error::Error,
    slip::{self, FrameMatcher, Response},
};

/// An open serial line to the ROM bootloader.
pub struct Connection {
    serial: Box<dyn SerialPort>,
    matcher: FrameMatcher,
}

impl Connection {
    /// Open `port` at `baud` (8 data bits, no parity, no flow control),
    /// reset the chip into bootloader mode and discard any boot noise.
    pub fn open(port: &str, baud: u32) -> Result<Self, Error> {
        let serial = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        info!("Connection success: {port}, baudrate: {baud}");
        info!("Serial port options: {baud} bps, 8 bits, parity: none, flow control: none");

        let mut connection = Connection::new(serial);
        connection.enter_bootloader()?;
        connection.flush_io()?;
        info!("Resetting {port} into bootloader mode");

        Ok(connection)
    }

    pub(crate) fn new(serial: Box<dyn SerialPort>) -> Self {
        Connection {
            serial,
            matcher: FrameMatcher::default(),
        }
    }

    /// Reset the chip into its serial bootloader.
    ///
    /// DTR  RTS  -->  EN  IO9  -->  Action
    ///  1    1        1    1       No action
    ///  0    0        1    1       Release bootloader mode
    ///  1    0        0    1       Reset the chip
    ///  0    1        1    0       Enter bootloader mode
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        sleep(Duration::from_millis(100));
        self.serial.write_data_terminal_ready(true)?;
        self.serial.write_request_to_send(false)?;

        sleep(Duration::from_millis(100));
        self.serial.write_data_terminal_ready(false)?;
        self.serial.write_request_to_send(true)?;

        sleep(Duration::from_millis(50));
        self.serial.write_data_terminal_ready(true)?;

        Ok(())
    }

    /// Release the bootloader and restart the application.
    fn hard_reset(&mut self) -> Result<(), Error> {
        self.serial.write_data_terminal_ready(true)?;
        self.serial.write_request_to_send(false)?;

        sleep(Duration::from_millis(100));
        self.serial.write_request_to_send(true)?;

        Ok(())
    }

    fn flush_io(&mut self) -> Result<(), Error> {
        self.serial.clear(ClearBuffer::All)?;

        Ok(())
    }

    /// Read whatever bytes are pending on the line, protocol or not.
    pub fn read_any(&mut self) -> Result<Vec<u8>, Error> {
        let pending = self.serial.bytes_to_read()? as usize;
        let mut buffer = vec![0u8; pending];
        if pending > 0 {
            self.serial.read_exact(&mut buffer)?;
        }
        self.flush_io()?;

        Ok(buffer)
    }

    /// Write raw bytes, bypassing command framing.
    pub fn write_any(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.serial.write_all(bytes)?;
        self.serial.flush()?;

        Ok(())
    }

    /// Send a command and wait for its decoded response.
    ///
    /// The command record is written up to `retries + 1` times; each attempt
    /// waits `timeout` for a complete frame. Timeouts consume a retry;
    /// decoder errors are structural and surface immediately.
    pub fn transceive(
        &mut self,
        command: &Command,
        retries: usize,
        timeout: Duration,
    ) -> Result<Response, Error> {
        let ty = command.command_type();
        let packet = slip::encode_packet(command)?;
        self.matcher.reset();

        for _ in 0..=retries {
            self.flush_io()?;

            self.serial.write_all(&packet)?;
            self.serial.flush()?;
            info!("Sending packet: {} ({:#04x})", ty, ty as u8);
            debug!("Packet content ({} bytes):\n{}", packet.len(), hexdump(&packet));

            if let Some(frame) = self.read_frame(Instant::now() + timeout)? {
                debug!("Received ({} bytes):\n{}", frame.len(), hexdump(&frame));
                return slip::decode_response(ty, &frame);
            }

            warn!("{ty}: serial port read timeout");
        }

        Err(Error::Timeout {
            command: ty,
            attempts: retries,
        })
    }

    /// Accumulate reads until the matcher reports a complete frame or the
    /// deadline passes, whichever happens first.
    fn read_frame(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, Error> {
        let mut buffer = Vec::with_capacity(1024);
        let mut chunk = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.serial.set_timeout(deadline - now)?;

            match self.serial.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(read) => {
                    buffer.extend_from_slice(&chunk[..read]);
                    if let Some(span) = self.matcher.find_frame(&buffer) {
                        return Ok(Some(buffer[span].to_vec()));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.hard_reset() {
            warn!("Failed to hard-reset the device on close: {err}");
        }
    }
}

fn hexdump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, row)| {
            let bytes = row
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{:04X}  {bytes}", i * 16)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
