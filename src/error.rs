//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid argument: {0}")]
    #[diagnostic(code(esplink::invalid_argument))]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(esplink::io))]
    Io(#[from] io::Error),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esplink::serial_error))]
    Serial(#[from] serialport::Error),

    #[error("Unexpected end of file while reading ELF structures")]
    #[diagnostic(
        code(esplink::short_read),
        help("The input file is truncated or its headers point outside the file")
    )]
    ShortRead,

    #[error("Supplied file is not a valid ELF executable: {0}")]
    #[diagnostic(
        code(esplink::invalid_elf),
        help("Check that the input is a linked ELF executable")
    )]
    InvalidElf(String),

    #[error("Unsupported ELF class {0:#04x}, expected 1 (ELF32) or 2 (ELF64)")]
    #[diagnostic(code(esplink::unsupported_class))]
    UnsupportedClass(u8),

    #[error("No program header contains address {addr:#010x}")]
    #[diagnostic(code(esplink::no_containing_segment))]
    NoContainingSegment { addr: u64 },

    #[error(
        "Image would contain {count} segments even after merging, the ROM loader accepts at most {max}"
    )]
    #[diagnostic(
        code(esplink::too_many_segments),
        help("Consolidate loadable sections in your linker script")
    )]
    TooManySegments { count: usize, max: usize },

    #[error("{command}: read failed after retrying {attempts} times")]
    #[diagnostic(
        code(esplink::timeout),
        help("Ensure that the device is connected and in bootloader mode")
    )]
    Timeout {
        command: CommandType,
        attempts: usize,
    },

    #[error("{command}: malformed response packet: {reason}")]
    #[diagnostic(
        code(esplink::protocol_violation),
        help("Try hard-resetting the device; if the error persists check the wiring")
    )]
    ProtocolViolation {
        command: CommandType,
        reason: String,
    },

    #[error("{command}: device reported error {code:#04x}: {}", rom_error_description(*.code))]
    #[diagnostic(code(esplink::command_failed))]
    CommandFailed { command: CommandType, code: u8 },
}

impl Error {
    /// Map the EOF reached while reading a fixed-size structure to the
    /// dedicated short-read error.
    pub(crate) fn short_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::ShortRead
        } else {
            Error::Io(err)
        }
    }
}

/// Status-trailer error codes reported by the ROM bootloader.
pub(crate) fn rom_error_description(code: u8) -> &'static str {
    match code {
        0x05 => "Received message is invalid (parameters or length field is invalid)",
        0x06 => "Failed to act on received message",
        0x07 => "Invalid CRC in message",
        0x08 => {
            "Mismatch in the 8-bit CRC between the value ROM loader reads back and the data \
             read from flash"
        }
        0x09 => "SPI read failed",
        0x0A => "SPI read request length is too long",
        0x0B => "Deflate error (compressed uploads only)",
        _ => "Unknown error",
    }
}
