//! ESP32 application image format
//!
//! Converts a parsed [`ElfFile`] into the binary layout understood by the
//! ROM bootloader: a 24-byte header, one record per loadable section, zero
//! padding to a 16-byte boundary and a single XOR checksum byte.

use std::{
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    str::FromStr,
};

use bytemuck::{bytes_of, Pod, Zeroable};
use log::{debug, info};

use crate::{
    elf::{Content, ElfContent, ElfFile, Word},
    error::Error,
    targets::Chip,
};

/// Leading byte of every ESP firmware image.
pub const ESP_MAGIC: u8 = 0xE9;
/// Seed of the image's XOR checksum.
pub const ESP_CHECKSUM_MAGIC: u8 = 0xEF;

const IMAGE_PADDING: usize = 16;
const SEGMENT_PADDING: usize = 4;

/// Firmware image header, 24 bytes, little-endian, no padding.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    /// SPI flash read mode
    pub flash_mode: u8,
    /// ..4 bits are the flash frequency, 4.. bits are the flash chip size
    pub flash_config: u8,
    pub entry: u32,
    pub wp_pin: u8,
    /// SPI pin drive settings
    pub clk_q_drv: u8,
    pub d_cs_drv: u8,
    pub gd_wp_drv: u8,
    pub chip_id: u16,
    pub min_rev: u8,
    pub reserved: [u8; 8],
    pub append_digest: u8,
}

/// Per-segment record preceding the payload bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SegmentHeader {
    pub addr: u32,
    pub length: u32,
}

/// SPI flash parameter identifiers stored in image header bytes 2 and 3.
///
/// The builder records zeros unless the user supplies values; the flasher
/// overlays the live values read back from the device onto the first block
/// it transmits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashSettings {
    pub mode: u8,
    pub freq: u8,
    pub size: u8,
}

impl FlashSettings {
    /// Header byte 3: size identifier in the high nibble, frequency in the
    /// low one.
    pub fn flash_config(&self) -> u8 {
        (self.size << 4) | (self.freq & 0x0F)
    }
}

impl FromStr for FlashSettings {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        let &[mode, freq, size] = fields.as_slice() else {
            return Err(Error::InvalidArgument(format!(
                "flash parameters must be given as `mode,freq,size`, got `{s}`"
            )));
        };

        let parse = |field: &str| {
            field.trim().parse::<u8>().map_err(|err| {
                Error::InvalidArgument(format!("invalid flash parameter `{field}`: {err}"))
            })
        };

        Ok(FlashSettings {
            mode: parse(mode)?,
            freq: parse(freq)?,
            size: parse(size)?,
        })
    }
}

/// XOR `data` into a running checksum.
pub fn update_checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= byte;
    }

    checksum
}

/// Round `size` up to the next multiple of `padding`.
pub fn padded_size(size: usize, padding: usize) -> usize {
    size.div_ceil(padding) * padding
}

/// Overlay the flash parameters and chip-id onto an image header sitting at
/// the start of `block`, so a reflash preserves the settings already on the
/// device.
pub fn patch_image_header(block: &mut [u8], settings: FlashSettings, chip: Chip) {
    if block.len() < 13 {
        return;
    }

    block[2] = settings.mode;
    block[3] = settings.flash_config();
    block[12] = chip.image_chip_id() as u8;
}

/// Build the firmware image for `chip` from a parsed ELF file, streaming
/// section payloads out of `source`.
pub fn write_image<R, W>(
    elf: &ElfFile,
    source: &mut R,
    writer: &mut W,
    chip: Chip,
    settings: FlashSettings,
) -> Result<(), Error>
where
    R: Read + Seek,
    W: Write,
{
    if !elf.identity.is_little_endian() {
        return Err(Error::InvalidElf(
            "big-endian executables cannot be converted to ESP images".into(),
        ));
    }

    match &elf.content {
        ElfContent::Elf32(content) => {
            write_content(content, source, writer, chip, chip.max_segments(), settings)
        }
        ElfContent::Elf64(content) => {
            write_content(content, source, writer, chip, chip.max_segments(), settings)
        }
    }
}

fn write_content<A, R, W>(
    content: &Content<A>,
    source: &mut R,
    writer: &mut W,
    chip: Chip,
    max_segments: usize,
    settings: FlashSettings,
) -> Result<(), Error>
where
    A: Word,
    R: Read + Seek,
    W: Write,
{
    let loadable = content.loadable_count();
    let sections = if loadable <= max_segments {
        info!("Found {loadable} loadable sections, within the ROM limit of {max_segments}");
        content.loadable_sections()
    } else {
        info!("Found {loadable} loadable sections, merging adjacent sections");
        let merged = content.merge_adjacent_loadable();
        if merged.len() > max_segments {
            return Err(Error::TooManySegments {
                count: merged.len(),
                max: max_segments,
            });
        }
        merged
    };

    let header = ImageHeader {
        magic: ESP_MAGIC,
        segment_count: sections.len() as u8,
        flash_mode: settings.mode,
        flash_config: settings.flash_config(),
        entry: address_to_u32(content.file_header.entry, "entry point")?,
        wp_pin: 0,
        clk_q_drv: 0,
        d_cs_drv: 0,
        gd_wp_drv: 0,
        chip_id: chip.image_chip_id(),
        min_rev: 0,
        reserved: [0; 8],
        append_digest: 0,
    };
    writer.write_all(bytes_of(&header))?;

    let mut image_len = size_of::<ImageHeader>();
    let mut checksum = ESP_CHECKSUM_MAGIC;

    for section in &sections {
        let size = usize::try_from(section.header.size.into()).map_err(|_| {
            Error::InvalidElf(format!("section {} too large", section.name))
        })?;
        let padded = padded_size(size, SEGMENT_PADDING);
        let addr = address_to_u32(section.header.addr, &section.name)?;

        let segment_header = SegmentHeader {
            addr,
            length: padded as u32,
        };
        writer.write_all(bytes_of(&segment_header))?;

        source.seek(SeekFrom::Start(section.header.offset.into()))?;
        let mut data = vec![0u8; size];
        source.read_exact(&mut data).map_err(Error::short_read)?;
        checksum = update_checksum(&data, checksum);
        writer.write_all(&data)?;

        let padding = &[0u8; SEGMENT_PADDING][0..padded - size];
        writer.write_all(padding)?;

        image_len += size_of::<SegmentHeader>() + padded;
        debug!(
            "Wrote segment {} at {addr:#010x}, {size} bytes ({padded} padded)",
            section.name
        );
    }

    // Checksum byte goes into the last byte of a 16-byte aligned image.
    let padded_len = padded_size(image_len + 1, IMAGE_PADDING);
    let padding = &[0u8; IMAGE_PADDING][0..padded_len - image_len - 1];
    writer.write_all(padding)?;
    writer.write_all(&[checksum])?;

    info!(
        "Image write completed: {} segments, {padded_len} bytes, checksum {checksum:#04x}",
        sections.len()
    );

    Ok(())
}

fn address_to_u32<A: Word>(addr: A, what: &str) -> Result<u32, Error> {
    u32::try_from(addr.into())
        .map_err(|_| Error::InvalidElf(format!("{what} address does not fit in 32 bits")))
}
