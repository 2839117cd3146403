use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;

/// Assemble a minimal RISC-V ELF32 executable with three loadable sections,
/// enough to exercise the whole ELF-to-image pipeline from the command line.
fn write_test_elf(path: &Path) {
    let mut image = vec![0u8; 0x3000];

    let patch = |image: &mut Vec<u8>, offset: usize, bytes: &[u8]| {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    // Identity: ELF32, little endian, version 1, SysV.
    patch(&mut image, 0, &[0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

    // File header: entry 0x40380000, one program header at 52,
    // five section headers at 0x2000, shstrtab at index 4.
    let mut header = Vec::new();
    header.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
    header.extend_from_slice(&0xF3u16.to_le_bytes()); // e_machine: RISC-V
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&0x4038_0000u32.to_le_bytes());
    header.extend_from_slice(&52u32.to_le_bytes());
    header.extend_from_slice(&0x2000u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&52u16.to_le_bytes());
    header.extend_from_slice(&32u16.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&40u16.to_le_bytes());
    header.extend_from_slice(&5u16.to_le_bytes());
    header.extend_from_slice(&4u16.to_le_bytes());
    patch(&mut image, 16, &header);

    // One PT_LOAD covering all three sections.
    let mut phdr = Vec::new();
    for word in [1u32, 0x1000, 0x4038_0000, 0x4038_0000, 0x110, 0x110, 0x5, 0x1000] {
        phdr.extend_from_slice(&word.to_le_bytes());
    }
    patch(&mut image, 52, &phdr);

    // Section payloads.
    let text: Vec<u8> = (0..0x100u32).map(|i| (i * 3 + 1) as u8).collect();
    let rodata: Vec<u8> = (0..0x0Du32).map(|i| (i + 0x80) as u8).collect();
    patch(&mut image, 0x1000, &text);
    patch(&mut image, 0x1100, &rodata);

    let names = b"\0.text\0.rodata\0.bss\0.shstrtab\0";
    patch(&mut image, 0x1800, names);

    // Section headers: NULL, .text, .rodata, .bss, .shstrtab.
    let sections: [[u32; 10]; 5] = [
        [0; 10],
        [1, 1, 0x6, 0x4038_0000, 0x1000, 0x100, 0, 0, 4, 0],
        [7, 1, 0x2, 0x4038_0100, 0x1100, 0x0D, 0, 0, 4, 0],
        [15, 8, 0x3, 0x4038_0110, 0x1110, 0x40, 0, 0, 4, 0],
        [20, 3, 0x0, 0, 0x1800, names.len() as u32, 0, 0, 1, 0],
    ];
    for (i, section) in sections.iter().enumerate() {
        let mut raw = Vec::new();
        for word in section {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        patch(&mut image, 0x2000 + i * 40, &raw);
    }

    fs::write(path, image).unwrap();
}

#[test]
fn mkbin_builds_a_valid_image() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let elf = dir.path().join("main.elf");
    let bin = dir.path().join("main.bin");
    write_test_elf(&elf);

    let mut cmd = Command::cargo_bin("esp_mkbin")?;
    cmd.arg("--file")
        .arg(&elf)
        .arg("--output")
        .arg(&bin)
        .arg("--chip")
        .arg("ESP32C3");
    cmd.assert().success();

    let image = fs::read(&bin)?;

    // 16-byte aligned, magic byte, segment count, entry point, chip id.
    assert_eq!(image.len() % 16, 0);
    assert_eq!(image[0], 0xE9);
    assert_eq!(image[1], 2);
    assert_eq!(&image[4..8], &[0x00, 0x00, 0x38, 0x40]);
    assert_eq!(image[12], 0x05);

    // First segment record: .text at its load address, padded length.
    assert_eq!(&image[24..28], &[0x00, 0x00, 0x38, 0x40]);
    assert_eq!(&image[28..32], &0x100u32.to_le_bytes());

    // Trailing checksum: XOR of all payload bytes, seeded with 0xEF.
    let mut checksum = 0xEFu8;
    for byte in (0..0x100u32).map(|i| (i * 3 + 1) as u8) {
        checksum ^= byte;
    }
    for byte in (0..0x0Du32).map(|i| (i + 0x80) as u8) {
        checksum ^= byte;
    }
    assert_eq!(*image.last().unwrap(), checksum);

    Ok(())
}

#[test]
fn mkbin_output_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let elf = dir.path().join("main.elf");
    write_test_elf(&elf);

    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");
    for output in [&first, &second] {
        let mut cmd = Command::cargo_bin("esp_mkbin")?;
        cmd.arg("--file")
            .arg(&elf)
            .arg("--output")
            .arg(output)
            .arg("--chip")
            .arg("ESP32C3");
        cmd.assert().success();
    }

    assert_eq!(fs::read(&first)?, fs::read(&second)?);

    Ok(())
}

#[test]
fn mkbin_rejects_unknown_chip_before_any_io() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("does_not_exist.elf");
    let bin = dir.path().join("out.bin");

    let mut cmd = Command::cargo_bin("esp_mkbin")?;
    cmd.arg("--file")
        .arg(&missing)
        .arg("--output")
        .arg(&bin)
        .arg("--chip")
        .arg("ESP9999");
    cmd.assert().failure();
    assert!(!bin.exists());

    Ok(())
}

#[test]
fn mkbin_rejects_non_elf_input() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("firmware.bin");
    fs::write(&input, [0u8; 4])?;

    let mut cmd = Command::cargo_bin("esp_mkbin")?;
    cmd.arg("--file")
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.bin"))
        .arg("--chip")
        .arg("ESP32");
    cmd.assert().failure();

    Ok(())
}

#[test]
fn flash_rejects_elf_input_without_a_port() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let elf = dir.path().join("main.elf");
    write_test_elf(&elf);

    let mut cmd = Command::cargo_bin("esp_flash")?;
    cmd.arg(&elf)
        .arg("--port")
        .arg("/dev/null")
        .arg("--offset")
        .arg("0");
    cmd.assert().failure();

    Ok(())
}
