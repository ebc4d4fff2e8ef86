//! Probing the running image for its architecture descriptor
//!
//! [`ArchProbe`] is the only thing the rest of the crate depends on. The
//! concrete [`ImageProbe`] is chosen at build time: ELF platforms read the
//! `Elf*_Ehdr` identification of the loaded image, Apple platforms read the
//! Mach-O header. [`FileProbe`] reads an ELF identification from disk.

use super::layout::layout_descriptor;
use super::{ArchDescriptor, ByteOrder, Machine, WordClass};
use crate::error::{Result, VmemError};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::error;

/// ELF identification magic
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Byte index of the ELF class field in `e_ident`
const EI_CLASS: usize = 4;
/// Byte index of the ELF data encoding field in `e_ident`
const EI_DATA: usize = 5;
/// Offset of `e_machine` (after `e_ident[16]` and `e_type`)
const E_MACHINE: usize = 18;
/// Bytes of the ELF header needed to identify an image
const ELF_PREFIX_LEN: usize = 20;

/// Capability that describes the current execution environment
pub trait ArchProbe {
    /// Produce the descriptor, or fail if the image cannot be identified
    fn probe(&self) -> Result<ArchDescriptor>;
}

/// Probe of the image this crate is loaded from
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProbe;

/// Probe the running process
pub fn probe() -> Result<ArchDescriptor> {
    ImageProbe.probe()
}

fn introspection_error(msg: &str) -> VmemError {
    error!("{}", msg);
    VmemError::Introspection(msg.to_string())
}

/// Decode machine, class and data encoding from the first bytes of an ELF header
///
/// `e_machine` is stored in the byte order named by `EI_DATA`, which lets a
/// foreign binary be identified correctly.
fn parse_elf_ident(bytes: &[u8]) -> Result<(Machine, WordClass, ByteOrder)> {
    if bytes.len() < ELF_PREFIX_LEN {
        return Err(introspection_error("ELF header truncated"));
    }

    if bytes[..4] != ELF_MAGIC {
        return Err(introspection_error("invalid ELF magic"));
    }

    let word_class = WordClass::from_u8(bytes[EI_CLASS])
        .ok_or_else(|| introspection_error("invalid ELF class"))?;
    let byte_order = ByteOrder::from_u8(bytes[EI_DATA])
        .ok_or_else(|| introspection_error("invalid ELF data encoding"))?;

    let raw = [bytes[E_MACHINE], bytes[E_MACHINE + 1]];
    let machine = match byte_order {
        ByteOrder::Little => u16::from_le_bytes(raw),
        ByteOrder::Big => u16::from_be_bytes(raw),
    };

    Ok((Machine::from_u16(machine), word_class, byte_order))
}

/// Locate the base address of the image that contains this function
fn image_base() -> Result<*const u8> {
    // SAFETY: Dl_info is plain C data; all-zero is a valid initial value.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let anchor = image_base as *const libc::c_void;

    // SAFETY: anchor points into this crate's code and info is writable.
    if unsafe { libc::dladdr(anchor, &mut info) } == 0 {
        return Err(introspection_error("dladdr failed"));
    }

    if info.dli_fbase.is_null() {
        return Err(introspection_error("dli_fbase not set"));
    }

    Ok(info.dli_fbase as *const u8)
}

#[cfg(not(target_vendor = "apple"))]
impl ArchProbe for ImageProbe {
    fn probe(&self) -> Result<ArchDescriptor> {
        let base = image_base()?;

        // SAFETY: the loader maps the whole first page of every image, and
        // the ELF header lies at its start.
        let header = unsafe { std::slice::from_raw_parts(base, ELF_PREFIX_LEN) };
        let (machine, word_class, byte_order) = parse_elf_ident(header)?;

        Ok(ArchDescriptor::new(
            machine,
            word_class,
            byte_order,
            layout_descriptor(),
        ))
    }
}

#[cfg(target_vendor = "apple")]
mod macho {
    use super::*;

    pub const MH_MAGIC: u32 = 0xFEED_FACE;
    pub const MH_CIGAM: u32 = 0xCEFA_EDFE;
    pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
    pub const MH_CIGAM_64: u32 = 0xCFFA_EDFE;

    const CPU_ARCH_ABI64: u32 = 0x0100_0000;
    const CPU_TYPE_X86: u32 = 7;
    const CPU_TYPE_ARM: u32 = 12;
    const CPU_TYPE_POWERPC: u32 = 18;

    pub fn machine(cputype: u32) -> Machine {
        match cputype {
            CPU_TYPE_X86 => Machine::X86,
            t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => Machine::X86_64,
            CPU_TYPE_ARM => Machine::Arm,
            t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => Machine::Aarch64,
            CPU_TYPE_POWERPC => Machine::PowerPc,
            t if t == CPU_TYPE_POWERPC | CPU_ARCH_ABI64 => Machine::PowerPc64,
            other => Machine::Other(other as u16),
        }
    }

    impl ArchProbe for ImageProbe {
        fn probe(&self) -> Result<ArchDescriptor> {
            let base = image_base()? as *const u32;

            // SAFETY: a Mach-O image starts with magic and cputype words.
            let (magic, cputype) = unsafe { (base.read_unaligned(), base.add(1).read_unaligned()) };

            let (word_class, swapped) = match magic {
                MH_MAGIC => (WordClass::Bits32, false),
                MH_MAGIC_64 => (WordClass::Bits64, false),
                MH_CIGAM => (WordClass::Bits32, true),
                MH_CIGAM_64 => (WordClass::Bits64, true),
                _ => return Err(introspection_error("invalid Mach-O magic")),
            };

            let (cputype, byte_order) = match (swapped, ByteOrder::native()) {
                (false, native) => (cputype, native),
                (true, ByteOrder::Little) => (cputype.swap_bytes(), ByteOrder::Big),
                (true, ByteOrder::Big) => (cputype.swap_bytes(), ByteOrder::Little),
            };

            Ok(ArchDescriptor::new(
                machine(cputype),
                word_class,
                byte_order,
                layout_descriptor(),
            ))
        }
    }
}

/// Probe that reads the ELF identification of a file on disk
///
/// The layout descriptor is the one of this build, as the file carries no
/// such information.
#[derive(Debug, Clone)]
pub struct FileProbe {
    path: PathBuf,
}

impl FileProbe {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileProbe {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchProbe for FileProbe {
    fn probe(&self) -> Result<ArchDescriptor> {
        let mut header = [0u8; ELF_PREFIX_LEN];
        File::open(&self.path)?.read_exact(&mut header)?;

        let (machine, word_class, byte_order) = parse_elf_ident(&header)?;

        Ok(ArchDescriptor::new(
            machine,
            word_class,
            byte_order,
            layout_descriptor(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn elf_prefix(class: u8, data: u8, machine: [u8; 2]) -> [u8; ELF_PREFIX_LEN] {
        let mut bytes = [0u8; ELF_PREFIX_LEN];
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[EI_CLASS] = class;
        bytes[EI_DATA] = data;
        bytes[E_MACHINE..E_MACHINE + 2].copy_from_slice(&machine);
        bytes
    }

    #[test]
    fn test_probe_matches_compile_target() {
        let desc = probe().unwrap();
        assert_eq!(desc.word_class(), WordClass::native());
        assert_eq!(desc.byte_order(), ByteOrder::native());
        assert_eq!(desc.layout_descriptor(), layout_descriptor());
        assert!(desc.reserved_is_zero());

        #[cfg(target_arch = "x86_64")]
        assert_eq!(desc.machine(), Machine::X86_64);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(desc.machine(), Machine::Aarch64);
    }

    #[test]
    fn test_probe_is_stable() {
        assert_eq!(probe().unwrap(), probe().unwrap());
    }

    #[test]
    fn test_parse_big_endian_ident() {
        let bytes = elf_prefix(2, 2, [0, 21]);
        let (machine, class, order) = parse_elf_ident(&bytes).unwrap();
        assert_eq!(machine, Machine::PowerPc64);
        assert_eq!(class, WordClass::Bits64);
        assert_eq!(order, ByteOrder::Big);
    }

    #[test]
    fn test_parse_little_endian_ident() {
        let bytes = elf_prefix(1, 1, [40, 0]);
        let (machine, class, order) = parse_elf_ident(&bytes).unwrap();
        assert_eq!(machine, Machine::Arm);
        assert_eq!(class, WordClass::Bits32);
        assert_eq!(order, ByteOrder::Little);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = elf_prefix(2, 1, [62, 0]);
        bytes[1] = b'X';
        assert!(matches!(
            parse_elf_ident(&bytes),
            Err(VmemError::Introspection(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_class() {
        let bytes = elf_prefix(0, 1, [62, 0]);
        assert!(matches!(
            parse_elf_ident(&bytes),
            Err(VmemError::Introspection(_))
        ));
    }

    #[test]
    fn test_file_probe_reads_crafted_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&elf_prefix(2, 2, [0, 22])).unwrap();
        file.write_all(&[0u8; 44]).unwrap();

        let desc = FileProbe::new(file.path()).probe().unwrap();
        assert_eq!(desc.machine(), Machine::S390);
        assert_eq!(desc.byte_order(), ByteOrder::Big);
        assert_eq!(desc.layout_descriptor(), layout_descriptor());
    }

    #[test]
    fn test_file_probe_not_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho not an elf file\n").unwrap();

        let result = FileProbe::new(file.path()).probe();
        assert!(matches!(result, Err(VmemError::Introspection(_))));
    }

    #[test]
    fn test_file_probe_missing_file() {
        let missing = FileProbe::new("/nonexistent/vmem/binary");
        assert_eq!(missing.path(), Path::new("/nonexistent/vmem/binary"));
        let result = missing.probe();
        assert!(matches!(result, Err(VmemError::Io(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_file_probe_of_own_executable_matches_image() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(FileProbe::new(exe).probe().unwrap(), probe().unwrap());
    }
}
