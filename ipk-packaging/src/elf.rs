// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Architecture detection from ELF headers.

Only the first 64 bytes of a file are read, which covers the ELF header of
both 32 and 64 bit binaries. Detection is best effort: anything that is not a
parseable ELF file yields no architecture and the package is tagged `all`.
*/

use {
    goblin::elf::{
        header::{self, ELFMAG, SELFMAG},
        Elf,
    },
    log::{debug, warn},
    std::{io::Read, path::Path},
};

/// Bytes needed to parse an ELF header.
const HEADER_PROBE_LEN: usize = 64;

/// Human name of an ELF machine type.
fn machine_name(machine: u16) -> String {
    match machine {
        header::EM_386 => "x86".to_string(),
        header::EM_X86_64 => "amd64".to_string(),
        header::EM_ARM => "arm".to_string(),
        header::EM_AARCH64 => "AArch64".to_string(),
        other => header::machine_to_str(other).to_string(),
    }
}

/// Normalize a machine name to a package architecture tag.
pub fn normalize_architecture(machine: &str) -> String {
    if machine.ends_with("86") {
        "i586".to_string()
    } else if machine == "amd64" {
        "x86_64".to_string()
    } else if machine == "AArch64" {
        "aarch64".to_string()
    } else {
        machine.to_string()
    }
}

/// Detect the architecture from an ELF header held in memory.
pub fn architecture_from_bytes(data: &[u8]) -> Option<String> {
    if data.len() < HEADER_PROBE_LEN || data[..SELFMAG] != ELFMAG[..] {
        return None;
    }

    match Elf::parse_header(&data[..HEADER_PROBE_LEN]) {
        Ok(header) => Some(normalize_architecture(&machine_name(header.e_machine))),
        Err(e) => {
            warn!("unable to parse ELF header: {}", e);
            None
        }
    }
}

/// Detect the architecture of the binary at `path`.
///
/// Returns `None` for missing, short or non-ELF files.
pub fn detect_architecture(path: &Path) -> Option<String> {
    let mut fh = match std::fs::File::open(path) {
        Ok(fh) => fh,
        Err(e) => {
            debug!("not probing {} for architecture: {}", path.display(), e);
            return None;
        }
    };

    match fh.metadata() {
        Ok(md) if md.len() >= HEADER_PROBE_LEN as u64 => {}
        _ => return None,
    }

    let mut buffer = [0u8; HEADER_PROBE_LEN];
    if let Err(e) = fh.read_exact(&mut buffer) {
        warn!("unable to read {}: {}", path.display(), e);
        return None;
    }

    let arch = architecture_from_bytes(&buffer);
    if let Some(arch) = &arch {
        debug!("{} is an ELF binary for {}", path.display(), arch);
    }

    arch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(class64: bool, machine: u16) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(ELFMAG);
        data[4] = if class64 { 2 } else { 1 };
        // Little endian, current version.
        data[5] = 1;
        data[6] = 1;
        // e_type = ET_EXEC
        data[16..18].copy_from_slice(&2u16.to_le_bytes());
        data[18..20].copy_from_slice(&machine.to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        if class64 {
            // e_ehsize
            data[52..54].copy_from_slice(&64u16.to_le_bytes());
        } else {
            data[40..42].copy_from_slice(&52u16.to_le_bytes());
        }
        data
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_architecture("x86"), "i586");
        assert_eq!(normalize_architecture("386"), "i586");
        assert_eq!(normalize_architecture("amd64"), "x86_64");
        assert_eq!(normalize_architecture("AArch64"), "aarch64");
        assert_eq!(normalize_architecture("arm"), "arm");
    }

    #[test]
    fn detects_machines() {
        assert_eq!(
            architecture_from_bytes(&elf_header(true, header::EM_AARCH64)).as_deref(),
            Some("aarch64")
        );
        assert_eq!(
            architecture_from_bytes(&elf_header(true, header::EM_X86_64)).as_deref(),
            Some("x86_64")
        );
        assert_eq!(
            architecture_from_bytes(&elf_header(false, header::EM_ARM)).as_deref(),
            Some("arm")
        );
        assert_eq!(
            architecture_from_bytes(&elf_header(false, header::EM_386)).as_deref(),
            Some("i586")
        );
    }

    #[test]
    fn non_elf_is_none() -> std::io::Result<()> {
        assert_eq!(architecture_from_bytes(&[0u8; 64]), None);
        assert_eq!(architecture_from_bytes(&ELFMAG[..]), None);

        let td = tempfile::tempdir()?;
        let html = td.path().join("index.html");
        std::fs::write(&html, "<html></html>")?;
        assert_eq!(detect_architecture(&html), None);
        assert_eq!(detect_architecture(&td.path().join("missing")), None);

        let bin = td.path().join("app");
        let mut data = elf_header(true, header::EM_ARM);
        data.extend_from_slice(&[0u8; 128]);
        std::fs::write(&bin, data)?;
        assert_eq!(detect_architecture(&bin).as_deref(), Some("arm"));

        Ok(())
    }
}
