// BPF object loading
//
// The kernel programs reference maps through fixed 64-bit placeholders baked
// into `ld_imm64` instructions. Real map fds only exist at runtime, so the
// instruction stream is patched in place before it is handed to the kernel.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use goblin::elf::{Elf, SectionHeader, section_header};
use thiserror::Error;

use super::map::MapError;
use crate::sys::bpf_load_program;

pub const CGROUP_INGRESS_SECTION: &str = "cgroup_ingress_prog";
pub const CGROUP_EGRESS_SECTION: &str = "cgroup_egress_prog";
pub const XT_INGRESS_SECTION: &str = "xt_ingress_prog";
pub const XT_EGRESS_SECTION: &str = "xt_egress_prog";

const PROGRAM_SECTIONS: [&str; 4] = [
    CGROUP_INGRESS_SECTION,
    CGROUP_EGRESS_SECTION,
    XT_INGRESS_SECTION,
    XT_EGRESS_SECTION,
];

/// BPF_LD | BPF_DW | BPF_IMM
const BPF_LD_IMM64: u8 = 0x18;
const BPF_REG_1: u8 = 1;
/// src_reg value marking the immediate as a map fd
const BPF_PSEUDO_MAP_FD: u8 = 1;
/// `ld_imm64` spans two instruction slots
const LD_IMM64_LEN: usize = 16;

const VERIFIER_LOG_SIZE: usize = 64 * 1024;
const DEFAULT_LICENSE: &CStr = c"GPL";

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("failed to read BPF object {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid BPF object: {0}")]
    InvalidObject(#[from] goblin::error::Error),

    #[error("BPF object has no section name string table")]
    MissingStringTable,

    #[error("section {index} lies outside the BPF object")]
    SectionOutOfBounds { index: usize },

    #[error("program section `{0}` is missing from the BPF object")]
    MissingSection(&'static str),

    #[error("no BPF object available to load `{0}` from")]
    NoObject(&'static str),

    #[error("kernel rejected program `{section}`: {io_error}")]
    Verifier {
        section: &'static str,
        io_error: io::Error,
        verifier_log: String,
    },

    #[error("failed to pin program at {}: {io_error}", path.display())]
    Pin { path: PathBuf, io_error: io::Error },

    #[error("failed to open cgroup {}: {source}", path.display())]
    Cgroup { path: PathBuf, source: io::Error },

    #[error("failed to attach program to {}: {io_error}", path.display())]
    Attach { path: PathBuf, io_error: io::Error },

    #[error(transparent)]
    Map(#[from] MapError),
}

impl ProgramError {
    pub fn errno(&self) -> i32 {
        match self {
            ProgramError::Read { source, .. } | ProgramError::Cgroup { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            ProgramError::Verifier { io_error, .. }
            | ProgramError::Pin { io_error, .. }
            | ProgramError::Attach { io_error, .. } => io_error.raw_os_error().unwrap_or(libc::EIO),
            ProgramError::Map(e) => e.errno(),
            ProgramError::MissingSection(_) | ProgramError::NoObject(_) => libc::ENOENT,
            ProgramError::InvalidObject(_)
            | ProgramError::MissingStringTable
            | ProgramError::SectionOutOfBounds { .. } => libc::EINVAL,
        }
    }
}

/// Program sections pulled out of a compiled BPF object
#[derive(Debug, Clone)]
pub struct ProgramObject {
    sections: HashMap<&'static str, Vec<u8>>,
    license: CString,
}

impl ProgramObject {
    pub fn from_file(path: &Path) -> Result<Self, ProgramError> {
        let bytes = fs::read(path).map_err(|source| ProgramError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Read BPF object {} ({} bytes)", path.display(), bytes.len());
        Self::parse(&bytes)
    }

    /// Copies the four program sections (and the license, if any) out of
    /// `bytes`. Everything else in the object is ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProgramError> {
        let elf = Elf::parse(bytes)?;
        if elf.header.e_shstrndx == section_header::SHN_UNDEF as u16 {
            return Err(ProgramError::MissingStringTable);
        }

        let mut sections = HashMap::new();
        let mut license = None;

        for (index, shdr) in elf.section_headers.iter().enumerate() {
            let Some(name) = elf.shdr_strtab.get_at(shdr.sh_name) else {
                continue;
            };

            if name == "license" {
                let data = section_data(bytes, shdr, index)?;
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                license = CString::new(&data[..end]).ok();
                continue;
            }

            if let Some(section) = PROGRAM_SECTIONS.iter().find(|s| **s == name) {
                let data = section_data(bytes, shdr, index)?;
                sections.insert(*section, data.to_vec());
            }
        }

        Ok(Self {
            sections,
            license: license.unwrap_or_else(|| DEFAULT_LICENSE.to_owned()),
        })
    }

    /// Instructions of `section`; a missing or empty section is a packaging
    /// problem and is reported as such
    pub fn section(&self, section: &'static str) -> Result<&[u8], ProgramError> {
        match self.sections.get(section) {
            Some(insns) if !insns.is_empty() => Ok(insns),
            _ => Err(ProgramError::MissingSection(section)),
        }
    }

    pub fn license(&self) -> &CStr {
        &self.license
    }
}

fn section_data<'a>(
    bytes: &'a [u8],
    shdr: &SectionHeader,
    index: usize,
) -> Result<&'a [u8], ProgramError> {
    // NOBITS sections have no file contents
    let Some(range) = shdr.file_range() else {
        return Ok(&[]);
    };
    bytes
        .get(range)
        .ok_or(ProgramError::SectionOutOfBounds { index })
}

/// Wide immediate load of `placeholder` into r1, as the compiler emits it
fn search_pattern(placeholder: u64) -> [u8; LD_IMM64_LEN] {
    let mut insn = [0u8; LD_IMM64_LEN];
    insn[0] = BPF_LD_IMM64;
    insn[1] = BPF_REG_1;
    insn[4..8].copy_from_slice(&(placeholder as u32).to_le_bytes());
    insn[12..16].copy_from_slice(&((placeholder >> 32) as u32).to_le_bytes());
    insn
}

/// Same load, marked as a map fd reference
fn replace_pattern(fd: u32) -> [u8; LD_IMM64_LEN] {
    let mut insn = [0u8; LD_IMM64_LEN];
    insn[0] = BPF_LD_IMM64;
    insn[1] = BPF_REG_1 | (BPF_PSEUDO_MAP_FD << 4);
    insn[4..8].copy_from_slice(&fd.to_le_bytes());
    insn
}

/// Rewrites every placeholder load in `insns` into a load of the paired map
/// fd. Returns the number of instructions patched.
///
/// The opcode byte can also show up inside immediates and offsets, so a
/// candidate that does not match moves the scan forward by one byte only.
pub fn patch_map_fds(insns: &mut [u8], maps: &[(u64, RawFd)]) -> usize {
    let patterns: Vec<([u8; LD_IMM64_LEN], [u8; LD_IMM64_LEN])> = maps
        .iter()
        .map(|&(placeholder, fd)| (search_pattern(placeholder), replace_pattern(fd as u32)))
        .collect();

    let mut patched = 0;
    let mut i = 0;
    while i + LD_IMM64_LEN <= insns.len() {
        if insns[i] != BPF_LD_IMM64 {
            i += 1;
            continue;
        }

        let window = &insns[i..i + LD_IMM64_LEN];
        match patterns.iter().find(|(search, _)| window == search) {
            Some((_, replace)) => {
                insns[i..i + LD_IMM64_LEN].copy_from_slice(replace);
                patched += 1;
                i += LD_IMM64_LEN;
            }
            None => i += 1,
        }
    }
    patched
}

/// Hands `insns` to the kernel. On rejection the verifier output is logged
/// and carried in the error.
pub fn load_program(
    prog_type: u32,
    section: &'static str,
    insns: &[u8],
    license: &CStr,
) -> Result<OwnedFd, ProgramError> {
    let mut log_buf = vec![0u8; VERIFIER_LOG_SIZE];

    match bpf_load_program(prog_type, insns, license, &mut log_buf) {
        Ok(fd) => {
            log::debug!(
                "Loaded program {} ({} instructions)",
                section,
                insns.len() / 8
            );
            Ok(fd)
        }
        Err((_, io_error)) => {
            let end = log_buf.iter().position(|&b| b == 0).unwrap_or(log_buf.len());
            let verifier_log = String::from_utf8_lossy(&log_buf[..end]).into_owned();

            log::error!("Failed to load program {}: {}", section, io_error);
            for line in verifier_log.lines() {
                log::error!("  {}", line);
            }

            Err(ProgramError::Verifier {
                section,
                io_error,
                verifier_log,
            })
        }
    }
}

/// Object built alongside the binary, when the kernel programs were compiled
#[cfg(bpf_programs_built)]
pub fn embedded_object() -> Option<&'static [u8]> {
    static OBJECT: &[u8] = include_bytes!(env!("TRAFFICD_BPF_OBJECT_PATH"));
    Some(OBJECT)
}

#[cfg(not(bpf_programs_built))]
pub fn embedded_object() -> Option<&'static [u8]> {
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sys::fake::FakeKernel;
    use crate::sys::BPF_PROG_TYPE_CGROUP_SKB;

    /// Little-endian ELF64 relocatable object with the given sections, laid
    /// out as: header, section contents, .shstrtab, section headers
    pub(crate) fn build_elf(sections: &[(&str, &[u8])]) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _) in sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let mut out = vec![0u8; 64];
        let mut offsets = Vec::new();
        for (_, data) in sections {
            offsets.push(out.len() as u64);
            out.extend_from_slice(data);
        }
        let shstrtab_off = out.len() as u64;
        out.extend_from_slice(&shstrtab);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;

        let shdr = |name: u32, sh_type: u32, off: u64, size: u64| {
            let mut h = Vec::with_capacity(64);
            h.extend_from_slice(&name.to_le_bytes());
            h.extend_from_slice(&sh_type.to_le_bytes());
            h.extend_from_slice(&0u64.to_le_bytes()); // flags
            h.extend_from_slice(&0u64.to_le_bytes()); // addr
            h.extend_from_slice(&off.to_le_bytes());
            h.extend_from_slice(&size.to_le_bytes());
            h.extend_from_slice(&0u32.to_le_bytes()); // link
            h.extend_from_slice(&0u32.to_le_bytes()); // info
            h.extend_from_slice(&8u64.to_le_bytes()); // addralign
            h.extend_from_slice(&0u64.to_le_bytes()); // entsize
            h
        };

        out.extend_from_slice(&[0u8; 64]);
        for (i, (_, data)) in sections.iter().enumerate() {
            out.extend_from_slice(&shdr(name_offsets[i], 1, offsets[i], data.len() as u64));
        }
        out.extend_from_slice(&shdr(shstrtab_name, 3, shstrtab_off, shstrtab.len() as u64));

        let shnum = sections.len() as u16 + 2;
        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        header.extend_from_slice(&[0u8; 8]);
        header.extend_from_slice(&1u16.to_le_bytes()); // ET_REL
        header.extend_from_slice(&247u16.to_le_bytes()); // EM_BPF
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes()); // entry
        header.extend_from_slice(&0u64.to_le_bytes()); // phoff
        header.extend_from_slice(&shoff.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // flags
        header.extend_from_slice(&64u16.to_le_bytes()); // ehsize
        header.extend_from_slice(&0u16.to_le_bytes()); // phentsize
        header.extend_from_slice(&0u16.to_le_bytes()); // phnum
        header.extend_from_slice(&64u16.to_le_bytes()); // shentsize
        header.extend_from_slice(&shnum.to_le_bytes());
        header.extend_from_slice(&(shnum - 1).to_le_bytes()); // shstrndx
        out[..64].copy_from_slice(&header);
        out
    }

    /// mov r0, 1; exit
    pub(crate) const RETURN_ONE: [u8; 16] = [
        0xb7, 0x00, 0, 0, 1, 0, 0, 0, //
        0x95, 0x00, 0, 0, 0, 0, 0, 0,
    ];

    #[test]
    fn test_patch_round_trip() {
        let placeholder = 0xAAAA_AAAA_AAAA_AAAAu64;
        let mut program = Vec::new();
        program.extend_from_slice(&RETURN_ONE[..8]);
        program.extend_from_slice(&search_pattern(placeholder));
        program.extend_from_slice(&RETURN_ONE);
        let original = program.clone();

        let elf = build_elf(&[(CGROUP_INGRESS_SECTION, &program)]);
        let object = ProgramObject::parse(&elf).unwrap();
        let mut insns = object.section(CGROUP_INGRESS_SECTION).unwrap().to_vec();
        assert_eq!(insns, original);

        assert_eq!(patch_map_fds(&mut insns, &[(placeholder, 7)]), 1);

        assert_eq!(insns[..8], original[..8]);
        assert_eq!(insns[24..], original[24..]);
        let window = &insns[8..24];
        assert_eq!(window[0], 0x18);
        assert_eq!(original[9], 0x01);
        assert_eq!(window[1], 0x11);
        let mut imm = [0u8; 8];
        imm[..4].copy_from_slice(&window[4..8]);
        imm[4..].copy_from_slice(&window[12..16]);
        assert_eq!(u64::from_le_bytes(imm), 7);
    }

    #[test]
    fn test_patch_fd_seven() {
        let placeholder = 0xAAAA_AAAA_AAAA_AAAAu64;
        let mut insns = search_pattern(placeholder).to_vec();
        patch_map_fds(&mut insns, &[(placeholder, 7)]);
        assert_eq!(
            insns,
            vec![0x18, 0x11, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_patch_finds_unaligned_and_overlapping_candidates() {
        let placeholder = 0xbfdd_dddd_dddd_ddddu64;
        // Stray opcode bytes right before the real instruction, off the 8-byte grid
        let mut insns = vec![0x18, 0x18, 0x18];
        insns.extend_from_slice(&search_pattern(placeholder));
        insns.extend_from_slice(&search_pattern(placeholder));

        assert_eq!(patch_map_fds(&mut insns, &[(placeholder, 9)]), 2);
        assert_eq!(&insns[..3], &[0x18, 0x18, 0x18]);
        assert_eq!(insns[4], 0x11);
        assert_eq!(insns[20], 0x11);
    }

    #[test]
    fn test_unknown_placeholder_left_alone() {
        let mut insns = search_pattern(0x1234).to_vec();
        let original = insns.clone();
        assert_eq!(patch_map_fds(&mut insns, &[(0x5678, 9)]), 0);
        assert_eq!(insns, original);
    }

    #[test]
    fn test_missing_section_is_distinct() {
        let elf = build_elf(&[(CGROUP_INGRESS_SECTION, &RETURN_ONE), (XT_EGRESS_SECTION, &[])]);
        let object = ProgramObject::parse(&elf).unwrap();

        assert!(object.section(CGROUP_INGRESS_SECTION).is_ok());
        assert!(matches!(
            object.section(CGROUP_EGRESS_SECTION),
            Err(ProgramError::MissingSection(CGROUP_EGRESS_SECTION))
        ));
        assert!(matches!(
            object.section(XT_EGRESS_SECTION),
            Err(ProgramError::MissingSection(_))
        ));
    }

    #[test]
    fn test_license_section_is_read() {
        let elf = build_elf(&[(CGROUP_INGRESS_SECTION, &RETURN_ONE), ("license", b"Apache 2.0\0")]);
        let object = ProgramObject::parse(&elf).unwrap();
        assert_eq!(object.license().to_str().unwrap(), "Apache 2.0");

        let elf = build_elf(&[(CGROUP_INGRESS_SECTION, &RETURN_ONE)]);
        let object = ProgramObject::parse(&elf).unwrap();
        assert_eq!(object.license().to_str().unwrap(), "GPL");
    }

    #[test]
    fn test_truncated_object_rejected() {
        let elf = build_elf(&[(CGROUP_INGRESS_SECTION, &RETURN_ONE)]);
        assert!(ProgramObject::parse(&elf[..40]).is_err());
    }

    #[test]
    fn test_missing_string_table_rejected() {
        let mut elf = build_elf(&[(CGROUP_INGRESS_SECTION, &RETURN_ONE)]);
        // e_shstrndx lives at offset 62
        elf[62] = 0;
        elf[63] = 0;
        assert!(matches!(
            ProgramObject::parse(&elf),
            Err(ProgramError::MissingStringTable)
        ));
    }

    #[test]
    fn test_verifier_rejection_carries_log() {
        let kernel = FakeKernel::install();
        kernel.reject_programs("0: (b7) r0 = 1\nR0 invalid mem access");

        let license = CString::new("GPL").unwrap();
        let err = load_program(
            BPF_PROG_TYPE_CGROUP_SKB,
            CGROUP_EGRESS_SECTION,
            &RETURN_ONE,
            &license,
        )
        .unwrap_err();

        match err {
            ProgramError::Verifier {
                section,
                verifier_log,
                ..
            } => {
                assert_eq!(section, CGROUP_EGRESS_SECTION);
                assert!(verifier_log.contains("invalid mem access"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_hands_instructions_to_kernel() {
        let kernel = FakeKernel::install();
        let license = CString::new("GPL").unwrap();
        let _fd = load_program(
            BPF_PROG_TYPE_CGROUP_SKB,
            CGROUP_INGRESS_SECTION,
            &RETURN_ONE,
            &license,
        )
        .unwrap();

        let programs = kernel.programs();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].0, BPF_PROG_TYPE_CGROUP_SKB);
        assert_eq!(programs[0].1, RETURN_ONE.to_vec());
    }
}
