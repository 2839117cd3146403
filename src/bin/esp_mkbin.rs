use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
};

use clap::Parser;
use esplink::{
    elf::ElfFile,
    error::Error,
    image_format::{self, FlashSettings},
    logging::initialize_logger,
    targets::Chip,
};
use log::LevelFilter;
use miette::{IntoDiagnostic, Result, WrapErr};

/// Convert a linked ELF executable into an ESP32 firmware image
#[derive(Debug, Parser)]
#[command(about, version, max_term_width = 100)]
struct Cli {
    /// ELF file to make a binary image from
    #[arg(long, value_name = "FILE")]
    file: PathBuf,

    /// Output file name
    #[arg(long, value_name = "FILE")]
    output: PathBuf,

    /// Chip to build the image for
    #[arg(long, value_enum, ignore_case = true)]
    chip: Chip,

    /// Flash parameters recorded in the image header, as `mode,freq,size`
    /// identifiers
    #[arg(long, value_name = "PARAMS")]
    flash_param: Option<FlashSettings>,

    /// Show debug messages during execution
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logger(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if cli.file.extension().map_or(true, |ext| ext != "elf") {
        return Err(Error::InvalidArgument(format!(
            "{} is not an .elf executable",
            cli.file.display()
        ))
        .into());
    }

    let file = File::open(&cli.file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open {}", cli.file.display()))?;
    let mut reader = BufReader::new(file);

    let elf = ElfFile::parse(&mut reader)?;
    elf.log_summary();

    let output = File::create(&cli.output)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to create {}", cli.output.display()))?;
    let mut writer = BufWriter::new(output);

    image_format::write_image(
        &elf,
        &mut reader,
        &mut writer,
        cli.chip,
        cli.flash_param.unwrap_or_default(),
    )?;
    writer.flush().into_diagnostic()?;

    Ok(())
}
