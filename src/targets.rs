//! Flashable target devices
//!
//! All chips listed here boot firmware images in the format produced by
//! [`crate::image_format`]; the variants double as the set of accepted
//! `--chip` values on the command line.

use strum::{Display, EnumString, VariantNames};

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames, clap::ValueEnum)]
#[strum(serialize_all = "UPPERCASE")]
#[value(rename_all = "UPPER")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-C3
    Esp32c3,
    /// ESP32-S3
    Esp32s3,
    /// ESP32-C2
    Esp32c2,
}

impl Chip {
    /// Chip-id recorded at offset 12 of the image header.
    pub fn image_chip_id(&self) -> u16 {
        match self {
            Chip::Esp32 => 0x0000,
            Chip::Esp32s2 => 0x0002,
            Chip::Esp32c3 => 0x0005,
            Chip::Esp32s3 => 0x0009,
            Chip::Esp32c2 => 0x000C,
        }
    }

    /// Upper bound the ROM loader places on the number of segments in an
    /// image. All of the supported chips share the same limit; only the
    /// ESP8266, which is not a build target, is lower (3).
    pub fn max_segments(&self) -> usize {
        16
    }
}

/// Map the silicon id read back from the chip-detect register to a chip name.
///
/// Unknown ids are reported as such; detection is informational and never
/// aborts a flash operation.
pub fn chip_name_from_silicon_id(id: u32) -> &'static str {
    match id {
        0xFFF0_C101 => "ESP8266",
        0x1B31_506F => "ESP32_C3_ECO3",
        _ => "Unknown",
    }
}
