//! Bootloader protocol commands
//!
//! Every command the ROM bootloader understands is a fixed byte plus a fixed
//! payload shape. [`Command`] models them as a closed sum; each variant
//! serialises its own record (direction, command byte, length, checksum,
//! payload) ready to be SLIP-framed.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::image_format::{update_checksum, ESP_CHECKSUM_MAGIC};

pub(crate) const REQUEST_DIRECTION: u8 = 0x00;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_BEGIN_TIMEOUT: Duration = Duration::from_millis(15_000);
const FLASH_DATA_TIMEOUT: Duration = Duration::from_millis(1_500);
const FLASH_READ_SLOW_TIMEOUT: Duration = Duration::from_millis(2_000);

// Default geometry reported to SPI_SET_PARAMS.
pub(crate) const SPI_TOTAL_SIZE: u32 = 4 * 1024 * 1024;
const SPI_BLOCK_SIZE: u32 = 64 * 1024;
const SPI_SECTOR_SIZE: u32 = 4 * 1024;
const SPI_PAGE_SIZE: u32 = 256;
const SPI_STATUS_MASK: u32 = 0xFFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    FlashReadSlow = 0x0E,
}

impl CommandType {
    /// How long to wait for the response before a retry. Erasing flash and
    /// reading it back through the slow path take far longer than the
    /// register-sized commands.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::FlashBegin => FLASH_BEGIN_TIMEOUT,
            CommandType::FlashData => FLASH_DATA_TIMEOUT,
            CommandType::FlashReadSlow => FLASH_READ_SLOW_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub enum Command<'a> {
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
    FlashBegin {
        erase_size: u32,
        packet_count: u32,
        packet_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    SpiSetParams {
        total_size: u32,
    },
    SpiAttach,
    FlashReadSlow {
        offset: u32,
        length: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::FlashReadSlow { .. } => CommandType::FlashReadSlow,
        }
    }

    /// Serialise the command record: direction and command byte, LE u16
    /// payload length, LE u32 checksum, payload bytes.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&[REQUEST_DIRECTION, self.command_type() as u8])?;
        match *self {
            Command::Sync => {
                let mut payload = [0x55u8; 36];
                payload[..4].copy_from_slice(&[0x07, 0x07, 0x12, 0x20]);
                write_basic(writer, &payload, 0)
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask,
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)
            }
            Command::ReadReg { address } => write_basic(writer, &address.to_le_bytes(), 0),
            Command::FlashBegin {
                erase_size,
                packet_count,
                packet_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct BeginParams {
                    erase_size: u32,
                    packet_count: u32,
                    packet_size: u32,
                    offset: u32,
                    encrypted: u32,
                }
                let params = BeginParams {
                    erase_size,
                    packet_count,
                    packet_size,
                    offset,
                    encrypted: 0,
                };
                write_basic(writer, bytes_of(&params), 0)
            }
            Command::FlashData { data, sequence } => data_command(writer, data, sequence),
            Command::FlashEnd { reboot } => {
                // 1 runs the user code, 0 stays in the loader.
                write_basic(writer, &u32::from(reboot).to_le_bytes(), 0)
            }
            Command::SpiSetParams { total_size } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct SpiParams {
                    id: u32,
                    total_size: u32,
                    block_size: u32,
                    sector_size: u32,
                    page_size: u32,
                    status_mask: u32,
                }
                let params = SpiParams {
                    id: 0,
                    total_size,
                    block_size: SPI_BLOCK_SIZE,
                    sector_size: SPI_SECTOR_SIZE,
                    page_size: SPI_PAGE_SIZE,
                    status_mask: SPI_STATUS_MASK,
                };
                write_basic(writer, bytes_of(&params), 0)
            }
            Command::SpiAttach => write_basic(writer, &[0u8; 6], 0),
            Command::FlashReadSlow { offset, length } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct ReadParams {
                    offset: u32,
                    length: u32,
                }
                let params = ReadParams { offset, length };
                write_basic(writer, bytes_of(&params), 0)
            }
        }
    }
}

fn write_basic<W: Write>(writer: &mut W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)
}

fn data_command<W: Write>(writer: &mut W, data: &[u8], sequence: u32) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }
    let params = BlockParams {
        size: data.len() as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let checksum = update_checksum(data, ESP_CHECKSUM_MAGIC);
    let total_length = size_of::<BlockParams>() + data.len();
    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&u32::from(checksum).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(data)
}
