//! ELF64 header/program-header parsing and acceptance checks.
//!
//! Mirrors `load_segment`/`load` from
//! `examples/original_source/pintos/userprog/process.c`, generalised to the
//! standard ELF64 layout (the original reads a handful of fixed offsets out
//! of a bare byte buffer; a real `Ehdr`/`Phdr` just names those offsets).

use alloc::vec::Vec;

pub const EI_MAG: [u8; 4] = *b"\x7fELF";
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFOSABI_SYSV: u8 = 0;
pub const EV_CURRENT: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_SHLIB: u32 = 5;

/// A program header count above this is rejected outright, matching the
/// budget the spec puts on `phnum` — there's no legitimate static binary in
/// this environment that comes close.
pub const MAX_PHNUM: u16 = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum LoadingError {
    InvalidHeader,
    UnsupportedSegment,
    BadSegmentLayout,
    TooManyHeaders,
}

/// The fixed-size ELF64 file header (`Elf64_Ehdr`).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// The fixed-size ELF64 program header (`Elf64_Phdr`).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

impl Ehdr {
    /// Parses and validates the header in place. Accepts exactly
    /// ELFCLASS64/little-endian/SysV/AMD64/version 1, matching the
    /// acceptance rules in full — anything else is a foreign or malformed
    /// image this loader was never meant to run.
    pub fn parse(binary: &[u8]) -> Result<Ehdr, LoadingError> {
        if binary.len() < size_of::<Ehdr>() {
            return Err(LoadingError::InvalidHeader);
        }
        let ehdr = unsafe { &*(binary.as_ptr() as *const Ehdr) };

        if ehdr.e_ident[0..4] != EI_MAG
            || ehdr.e_ident[4] != ELFCLASS64
            || ehdr.e_ident[5] != ELFDATA2LSB
            || ehdr.e_ident[7] != ELFOSABI_SYSV
            || ehdr.e_version != EV_CURRENT as u32
            || ehdr.e_type != ET_EXEC
            || ehdr.e_machine != EM_X86_64
        {
            return Err(LoadingError::InvalidHeader);
        }

        if ehdr.e_phentsize as usize != size_of::<Phdr>() {
            return Err(LoadingError::InvalidHeader);
        }
        if ehdr.e_phnum > MAX_PHNUM {
            return Err(LoadingError::TooManyHeaders);
        }

        Ok(*ehdr)
    }

    /// Reads out the program header table, rejecting anything but
    /// `PT_LOAD` and the informational types the original loader silently
    /// skips (`PT_DYNAMIC`/`PT_INTERP`/`PT_SHLIB` are explicitly refused —
    /// a statically linked, non-interpreted binary is the only kind this
    /// loader ever builds a process image from).
    pub fn program_headers(&self, binary: &[u8]) -> Result<Vec<Phdr>, LoadingError> {
        let start = self.e_phoff as usize;
        let count = self.e_phnum as usize;
        let entsize = self.e_phentsize as usize;
        let end = start
            .checked_add(count.checked_mul(entsize).ok_or(LoadingError::InvalidHeader)?)
            .ok_or(LoadingError::InvalidHeader)?;
        if end > binary.len() {
            return Err(LoadingError::InvalidHeader);
        }

        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let offset = start + i * entsize;
            let phdr = unsafe { *(binary[offset..offset + entsize].as_ptr() as *const Phdr) };
            match phdr.p_type {
                PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(LoadingError::UnsupportedSegment),
                _ => {}
            }
            headers.push(phdr);
        }
        Ok(headers)
    }
}

impl Phdr {
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    pub fn readable(&self) -> bool {
        self.p_flags & PF_R != 0
    }
    pub fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }
    pub fn executable(&self) -> bool {
        self.p_flags & PF_X != 0
    }

    /// Validates the segment the way `validate_segment` does: the file
    /// offset/vaddr must agree mod page size, the segment must fit inside
    /// the file, memsz must be non-zero, and the mapped range must land
    /// entirely in user space without wrapping or touching page zero.
    pub fn validate(&self, file_len: usize) -> Result<(), LoadingError> {
        const PAGE_SIZE: u64 = 4096;

        if self.p_memsz == 0 {
            return Err(LoadingError::BadSegmentLayout);
        }
        if self.p_offset % PAGE_SIZE != self.p_vaddr % PAGE_SIZE {
            return Err(LoadingError::BadSegmentLayout);
        }
        let file_end = self
            .p_offset
            .checked_add(self.p_filesz)
            .ok_or(LoadingError::BadSegmentLayout)?;
        if file_end > file_len as u64 {
            return Err(LoadingError::BadSegmentLayout);
        }
        let vaddr_end = self
            .p_vaddr
            .checked_add(self.p_memsz)
            .ok_or(LoadingError::BadSegmentLayout)?;
        if self.p_vaddr < PAGE_SIZE || vaddr_end & (1 << 63) != 0 {
            return Err(LoadingError::BadSegmentLayout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ehdr() -> Ehdr {
        Ehdr {
            e_ident: [
                0x7f, b'E', b'L', b'F', ELFCLASS64, ELFDATA2LSB, EV_CURRENT, ELFOSABI_SYSV, 0, 0,
                0, 0, 0, 0, 0, 0,
            ],
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: EV_CURRENT as u32,
            e_entry: 0x1000,
            e_phoff: size_of::<Ehdr>() as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: size_of::<Ehdr>() as u16,
            e_phentsize: size_of::<Phdr>() as u16,
            e_phnum: 0,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
    }

    #[test]
    fn accepts_a_well_formed_header() {
        let ehdr = sample_ehdr();
        let bytes = as_bytes(&ehdr).to_vec();
        assert!(Ehdr::parse(&bytes).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut ehdr = sample_ehdr();
        ehdr.e_ident[0] = 0;
        let bytes = as_bytes(&ehdr).to_vec();
        assert_eq!(Ehdr::parse(&bytes), Err(LoadingError::InvalidHeader));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut ehdr = sample_ehdr();
        ehdr.e_machine = 0x03; // EM_386
        let bytes = as_bytes(&ehdr).to_vec();
        assert_eq!(Ehdr::parse(&bytes), Err(LoadingError::InvalidHeader));
    }

    #[test]
    fn rejects_too_many_program_headers() {
        let mut ehdr = sample_ehdr();
        ehdr.e_phnum = MAX_PHNUM + 1;
        let bytes = as_bytes(&ehdr).to_vec();
        assert_eq!(Ehdr::parse(&bytes), Err(LoadingError::TooManyHeaders));
    }

    #[test]
    fn rejects_dynamic_segment() {
        let mut ehdr = sample_ehdr();
        ehdr.e_phnum = 1;
        let phdr = Phdr {
            p_type: PT_DYNAMIC,
            p_flags: PF_R,
            p_offset: 0,
            p_vaddr: 0x1000,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 8,
            p_align: 8,
        };
        let mut bytes = as_bytes(&ehdr).to_vec();
        bytes.extend_from_slice(as_bytes(&phdr));
        assert_eq!(
            ehdr.program_headers(&bytes),
            Err(LoadingError::UnsupportedSegment)
        );
    }

    #[test]
    fn validates_segment_page_alignment_consistency() {
        let phdr = Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0x1000,
            p_vaddr: 0x401000,
            p_paddr: 0,
            p_filesz: 0x100,
            p_memsz: 0x100,
            p_align: 0x1000,
        };
        assert!(phdr.validate(0x2000).is_ok());
    }

    #[test]
    fn rejects_segment_with_mismatched_page_offsets() {
        let phdr = Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: 0x1001,
            p_vaddr: 0x401000,
            p_paddr: 0,
            p_filesz: 0x100,
            p_memsz: 0x100,
            p_align: 0x1000,
        };
        assert_eq!(phdr.validate(0x2000), Err(LoadingError::BadSegmentLayout));
    }

    #[test]
    fn rejects_segment_overlapping_page_zero() {
        let phdr = Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0x100,
            p_memsz: 0x100,
            p_align: 0x1000,
        };
        assert_eq!(phdr.validate(0x2000), Err(LoadingError::BadSegmentLayout));
    }
}
