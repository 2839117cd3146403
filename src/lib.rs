//! A library and applications for flashing Espressif devices over serial
//!
//! Two binaries are built from this crate:
//!
//! - `esp_mkbin` converts a linked ELF executable into the firmware image
//!   format expected by the ESP32 family's ROM bootloader.
//! - `esp_flash` writes such an image to a device over a serial line, using
//!   the SLIP-framed command protocol spoken by the ROM bootloader.
//!
//! The crate can also be used as a library; [`elf`] and [`image_format`]
//! cover the image side, while [`connection`], [`command`], [`slip`] and
//! [`flasher`] cover the serial protocol.

pub mod command;
pub mod connection;
pub mod elf;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod slip;
pub mod targets;

pub use self::error::Error;

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
