use std::path::PathBuf;

use clap::Parser;
use esplink::{
    error::Error, flasher::Flasher, image_format::FlashSettings, logging::initialize_logger,
    targets::Chip,
};
use log::LevelFilter;
use miette::Result;

/// Flash a prebuilt ESP32 firmware image to a device in bootloader mode
#[derive(Debug, Parser)]
#[command(about, version, max_term_width = 100)]
struct Cli {
    /// Prebuilt binary image to flash
    file: PathBuf,

    /// Serial port of the connected ESP MCU
    #[arg(long, value_name = "DEV")]
    port: String,

    /// Baud rate of the communication
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Flash offset, in hexadecimal
    #[arg(long, value_name = "HEX", value_parser = parse_hex_offset)]
    offset: u32,

    /// Chip type of the connected device
    #[arg(long, value_enum, ignore_case = true, default_value_t = Chip::Esp32c3)]
    chip: Chip,

    /// Flash parameters to overlay on the image header, as `mode,freq,size`
    /// identifiers; defaults to the values read back from the device
    #[arg(long, value_name = "PARAMS")]
    flash_param: Option<FlashSettings>,

    /// Show debug messages during execution
    #[arg(long)]
    verbose: bool,
}

fn parse_hex_offset(raw: &str) -> std::result::Result<u32, String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);

    u32::from_str_radix(digits, 16).map_err(|err| format!("invalid hexadecimal offset `{raw}`: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logger(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if cli.file.extension().is_some_and(|ext| ext == "elf") {
        return Err(Error::InvalidArgument(
            "elf files are not supported, flash a prebuilt .bin image".into(),
        )
        .into());
    }

    let mut flasher = Flasher::connect(&cli.port, cli.baud)?;
    flasher.load_image(&cli.file, cli.chip, cli.offset, cli.flash_param)?;

    Ok(())
}
