//! Write a binary application image to a target device
//!
//! [`Flasher`] drives the ROM bootloader state machine over an open
//! [`Connection`]: synchronise, identify the chip, attach the SPI flash and
//! stream the image out in 4 KiB blocks.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use crate::{
    command::{Command, CommandType, SPI_TOTAL_SIZE},
    connection::Connection,
    error::Error,
    image_format::{patch_image_header, FlashSettings, ESP_MAGIC},
    targets::{chip_name_from_silicon_id, Chip},
};

/// Payload size of one FLASH_DATA packet.
pub const FLASH_BLOCK_SIZE: usize = 4096;

const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

// The ROM bootloader needs many sync attempts to settle after reset.
const SYNC_RETRIES: usize = 50;
const READ_REG_RETRIES: usize = 50;
const FLASH_BEGIN_RETRIES: usize = 1;
const FLASH_DATA_RETRIES: usize = 1;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// A connected device, synchronised and ready to accept flash commands.
pub struct Flasher {
    connection: Connection,
}

impl Flasher {
    /// Open the serial port, reset the chip into bootloader mode,
    /// synchronise with it and read its silicon id.
    pub fn connect(port: &str, baud: u32) -> Result<Self, Error> {
        let mut connection = Connection::open(port, baud)?;

        connection.transceive(&Command::Sync, SYNC_RETRIES, CommandType::Sync.timeout())?;

        let detect = connection.transceive(
            &Command::ReadReg {
                address: CHIP_DETECT_MAGIC_REG_ADDR,
            },
            READ_REG_RETRIES,
            CommandType::ReadReg.timeout(),
        )?;
        info!(
            "ESP chip detected, (id, chip name) = ({:#x}, {})",
            detect.value,
            chip_name_from_silicon_id(detect.value)
        );

        Ok(Flasher { connection })
    }

    /// Write the image at `path` to flash at `offset`, then reboot into it.
    ///
    /// The flash mode/frequency/size identifiers already stored on the
    /// device are read back first and overlaid onto the header of the first
    /// block, so a reflash preserves them; `settings` overrides that with
    /// user-supplied values.
    pub fn load_image(
        &mut self,
        path: &Path,
        chip: Chip,
        offset: u32,
        settings: Option<FlashSettings>,
    ) -> Result<(), Error> {
        self.connection
            .transceive(&Command::SpiAttach, 0, DEFAULT_TIMEOUT)?;
        self.connection.transceive(
            &Command::SpiSetParams {
                total_size: SPI_TOTAL_SIZE,
            },
            0,
            DEFAULT_TIMEOUT,
        )?;

        let settings = match settings {
            Some(settings) => settings,
            None => self.read_flash_settings()?,
        };

        let file = File::open(path)?;
        let file_size = u32::try_from(file.metadata()?.len()).map_err(|_| {
            Error::InvalidArgument(format!("{} does not fit in flash", path.display()))
        })?;
        let packets = file_size.div_ceil(FLASH_BLOCK_SIZE as u32);
        info!("Reading file: {}, file size: {file_size}", path.display());
        info!("Erasing {file_size} bytes in flash at offset {offset:#x}");

        self.connection.transceive(
            &Command::FlashBegin {
                erase_size: file_size,
                packet_count: packets,
                packet_size: FLASH_BLOCK_SIZE as u32,
                offset,
            },
            FLASH_BEGIN_RETRIES,
            CommandType::FlashBegin.timeout(),
        )?;

        let progress = ProgressBar::new(packets.into());
        progress.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos:>4}/{len:4} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut reader = BufReader::new(file);
        let mut block = vec![0u8; FLASH_BLOCK_SIZE];
        for sequence in 0..packets {
            let read = read_block(&mut reader, &mut block)?;
            let data = &mut block[..read];
            if sequence == 0 {
                patch_image_header(data, settings, chip);
            }

            let response = self.connection.transceive(
                &Command::FlashData { data, sequence },
                FLASH_DATA_RETRIES,
                CommandType::FlashData.timeout(),
            )?;
            if response.command != CommandType::FlashData as u8 {
                return Err(Error::ProtocolViolation {
                    command: CommandType::FlashData,
                    reason: format!("response echoes command byte {:#04x}", response.command),
                });
            }

            progress.inc(1);
        }
        progress.finish_and_clear();

        self.connection
            .transceive(&Command::FlashEnd { reboot: true }, 0, DEFAULT_TIMEOUT)?;
        info!("Flashing completed, {packets} packets written");

        Ok(())
    }

    /// Read the image header already in flash to recover the SPI settings
    /// recorded there. A blank or foreign flash is not an error; the
    /// settings then stay zero, matching a freshly built image header.
    fn read_flash_settings(&mut self) -> Result<FlashSettings, Error> {
        let response = self.connection.transceive(
            &Command::FlashReadSlow {
                offset: 0,
                length: 16,
            },
            0,
            CommandType::FlashReadSlow.timeout(),
        )?;

        let header = &response.payload;
        if header.len() < 4 || header[0] != ESP_MAGIC {
            warn!("No image header found in flash, flash parameters left at zero");
            return Ok(FlashSettings::default());
        }

        let settings = FlashSettings {
            mode: header[2],
            freq: header[3] & 0x0F,
            size: header[3] >> 4,
        };
        info!(
            "Using flash mode: {}, flash frequency: {}, flash chip size: {}",
            settings.mode, settings.freq, settings.size
        );

        Ok(settings)
    }
}

fn read_block<R: Read>(reader: &mut R, block: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..])? {
            0 => break,
            read => filled += read,
        }
    }

    Ok(filled)
}
