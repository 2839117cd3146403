//! SLIP framing for the bootloader serial protocol
//!
//! Outgoing command records are byte-stuffed and wrapped in `0xC0` END
//! markers; inbound frames are unstuffed, their 8-byte response header and
//! 4-byte status trailer decoded. [`FrameMatcher`] answers the streaming
//! question: has a complete response frame arrived in the receive buffer yet?

use std::{io::Write, ops::Range};

use crate::{
    command::{Command, CommandType},
    error::Error,
};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

const RESPONSE_DIRECTION: u8 = 0x01;
const HEADER_SIZE: usize = 8;
const STATUS_TRAILER_SIZE: usize = 4;

/// Smallest span a frame can occupy on the wire: the 8-byte header plus two
/// data bytes and the delimiters.
pub(crate) const MIN_FRAME: usize = HEADER_SIZE + 2 + 2;

/// A decoded response record.
#[derive(Debug, Clone)]
pub struct Response {
    /// Echo of the command byte this responds to.
    pub command: u8,
    /// Declared data field size.
    pub size: u16,
    /// The 32-bit value slot; READ_REG returns the register contents here.
    pub value: u32,
    pub payload: Vec<u8>,
}

struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    fn new(writer: &'a mut W) -> std::io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer })
    }

    fn finish(self) -> std::io::Result<()> {
        self.writer.write_all(&[END])
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => self.writer.write_all(&[ESC, ESC_END])?,
                ESC => self.writer.write_all(&[ESC, ESC_ESC])?,
                _ => self.writer.write_all(&[*value])?,
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Serialise and frame a command record, ready to be written to the wire.
pub fn encode_packet(command: &Command) -> std::io::Result<Vec<u8>> {
    let mut packet = Vec::new();
    let mut encoder = SlipEncoder::new(&mut packet)?;
    command.write(&mut encoder)?;
    encoder.finish()?;

    Ok(packet)
}

/// Unstuff and decode a received frame.
///
/// The buffer may carry its leading and trailing END markers; both are
/// stripped. A non-zero status byte in the trailer is raised as
/// [`Error::CommandFailed`] with the device's error code.
pub fn decode_response(command: CommandType, frame: &[u8]) -> Result<Response, Error> {
    let start = frame.iter().position(|&b| b == END).map_or(0, |i| i + 1);

    let mut data = Vec::with_capacity(frame.len());
    let mut bytes = frame[start.min(frame.len())..].iter().copied();
    while let Some(byte) = bytes.next() {
        match byte {
            END => break,
            ESC => match bytes.next() {
                Some(ESC_END) => data.push(END),
                Some(ESC_ESC) => data.push(ESC),
                Some(other) => data.push(other),
                None => break,
            },
            other => data.push(other),
        }
    }

    if data.len() < HEADER_SIZE + STATUS_TRAILER_SIZE {
        return Err(Error::ProtocolViolation {
            command,
            reason: format!("frame too short, {} bytes after unstuffing", data.len()),
        });
    }
    if data[0] != RESPONSE_DIRECTION {
        return Err(Error::ProtocolViolation {
            command,
            reason: format!("bad direction byte {:#04x}", data[0]),
        });
    }

    let status = data[data.len() - STATUS_TRAILER_SIZE];
    if status != 0 {
        return Err(Error::CommandFailed {
            command,
            code: data[data.len() - STATUS_TRAILER_SIZE + 1],
        });
    }

    let size = u16::from_le_bytes([data[2], data[3]]);
    let value = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let payload_end = (HEADER_SIZE + size as usize).min(data.len());

    Ok(Response {
        command: data[1],
        size,
        value,
        payload: data[HEADER_SIZE..payload_end].to_vec(),
    })
}

/// Streaming detector for complete response frames.
///
/// The receive buffer grows between calls; each call rescans it. A frame
/// start is an END marker followed by the response direction byte. The
/// `unpaired_start` latch remembers a start whose closing marker has not
/// arrived yet, so a bare END in a later buffer can be recognised as the
/// frame end. The latch belongs to one transport and is reset at every
/// transceive entry.
#[derive(Debug, Default)]
pub struct FrameMatcher {
    unpaired_start: bool,
}

impl FrameMatcher {
    pub fn reset(&mut self) {
        self.unpaired_start = false;
    }

    /// Scan `buffer` for a complete frame. Returns the byte range of the
    /// frame, inclusive of both END markers.
    pub fn find_frame(&mut self, buffer: &[u8]) -> Option<Range<usize>> {
        if buffer.len() < MIN_FRAME {
            return None;
        }

        let mut from = 0;
        while let Some(start) = find_end(buffer, from) {
            if buffer.get(start + 1) == Some(&RESPONSE_DIRECTION) {
                self.unpaired_start = true;
                let end = find_end(buffer, start + 2)?;
                if end - start >= MIN_FRAME {
                    self.unpaired_start = false;
                    return Some(start..end + 1);
                }
                return None;
            }

            if self.unpaired_start {
                self.unpaired_start = false;
                return Some(0..start + 1);
            }

            from = start + 1;
        }

        None
    }
}

fn find_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..].iter().position(|&b| b == END).map(|i| i + from)
}
