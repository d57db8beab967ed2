// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-only helpers for constructing synthetic Mach-O binaries.
//!
//! The produced binaries are minimal but structurally valid: a `__TEXT`
//! segment with one section, a trailing `__LINKEDIT` segment, and a symbol
//! table command referencing it. That is enough for the signing machinery
//! to analyze, digest, and rewrite them.

use {
    goblin::{
        container::{Container, Ctx, Endian},
        mach::{
            cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64},
            header::{Header, MH_MAGIC_64},
            load_command::{
                Section64, SegmentCommand64, SymtabCommand, LC_SEGMENT_64, LC_SYMTAB,
                SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_64,
            },
        },
    },
    scroll::IOwrite,
    std::io::Write,
};

const MH_EXECUTE: u32 = 0x2;

/// sizeof(symtab_command): 6 u32 fields.
const SIZEOF_SYMTAB_COMMAND: usize = 24;

const TEXT_FILE_SIZE: u64 = 0x1000;
const TEXT_SECTION_OFFSET: u32 = 0x400;
const TEXT_SECTION_SIZE: u64 = 0x200;
const LINKEDIT_FILE_SIZE: u64 = 0x20;

fn padded_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Builds minimal 64-bit little-endian Mach-O executables.
pub(crate) struct MachOBuilder {
    cputype: u32,
    cpusubtype: u32,
}

impl MachOBuilder {
    pub fn new_aarch64() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
        }
    }

    pub fn new_x86_64() -> Self {
        Self {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
        }
    }

    /// Override the CPU type, e.g. to produce an unsupported architecture.
    pub fn cputype(mut self, cputype: u32) -> Self {
        self.cputype = cputype;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let ctx = Ctx::new(Container::Big, Endian::Little);

        let sizeofcmds = (SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64)
            + SIZEOF_SEGMENT_COMMAND_64
            + SIZEOF_SYMTAB_COMMAND;

        let header = Header {
            magic: MH_MAGIC_64,
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            filetype: MH_EXECUTE,
            ncmds: 3,
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        };

        let text_segment = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64) as u32,
            segname: padded_name("__TEXT"),
            vmaddr: 0x1_0000_0000,
            vmsize: 0x4000,
            fileoff: 0,
            filesize: TEXT_FILE_SIZE,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };

        let text_section = Section64 {
            sectname: padded_name("__text"),
            segname: padded_name("__TEXT"),
            addr: 0x1_0000_0000 + TEXT_SECTION_OFFSET as u64,
            size: TEXT_SECTION_SIZE,
            offset: TEXT_SECTION_OFFSET,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0x8000_0400,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };

        let linkedit_segment = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
            segname: padded_name("__LINKEDIT"),
            vmaddr: 0x1_0000_4000,
            vmsize: 0x4000,
            fileoff: TEXT_FILE_SIZE,
            filesize: LINKEDIT_FILE_SIZE,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };

        // An empty symbol table whose string table occupies __LINKEDIT,
        // giving the rewrite pass a linkedit-referencing offset to preserve.
        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SIZEOF_SYMTAB_COMMAND as u32,
            symoff: TEXT_FILE_SIZE as u32,
            nsyms: 0,
            stroff: TEXT_FILE_SIZE as u32,
            strsize: LINKEDIT_FILE_SIZE as u32,
        };

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        cursor.iowrite_with(header, ctx).unwrap();
        cursor.iowrite_with(text_segment, ctx.le).unwrap();
        cursor.iowrite_with(text_section, ctx.le).unwrap();
        cursor.iowrite_with(linkedit_segment, ctx.le).unwrap();
        cursor.iowrite_with(symtab, ctx.le).unwrap();

        // Zero fill up to the section content, then a deterministic pattern
        // so page digests aren't digests of all zeroes.
        let pos = cursor.position() as usize;
        cursor
            .write_all(&vec![0u8; TEXT_SECTION_OFFSET as usize - pos])
            .unwrap();
        cursor
            .write_all(
                &(0..TEXT_SECTION_SIZE)
                    .map(|i| (i as u8).wrapping_mul(31).wrapping_add(7))
                    .collect::<Vec<_>>(),
            )
            .unwrap();

        let pos = cursor.position() as usize;
        cursor
            .write_all(&vec![0u8; TEXT_FILE_SIZE as usize - pos])
            .unwrap();

        // __LINKEDIT content (the empty string table).
        cursor
            .write_all(&vec![0u8; LINKEDIT_FILE_SIZE as usize])
            .unwrap();

        cursor.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_output_parses() {
        let data = MachOBuilder::new_aarch64().build();
        assert_eq!(data.len(), (TEXT_FILE_SIZE + LINKEDIT_FILE_SIZE) as usize);

        let macho = goblin::mach::MachO::parse(&data, 0).unwrap();
        assert_eq!(macho.segments.len(), 2);
        assert_eq!(macho.header.cputype(), CPU_TYPE_ARM64);

        let names = macho
            .segments
            .iter()
            .map(|s| s.name().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["__TEXT", "__LINKEDIT"]);
    }
}
