//! Hand-assembled ELF images for tests.
//!
//! The layout is deliberately minimal: one `PT_LOAD` mapping the whole
//! file at the image base, plus `PT_PHDR`, `PT_INTERP` and
//! `PT_DYNAMIC`, with `.interp`, `.dynstr`, `.dynamic` and `.shstrtab`
//! sections. Both 64-bit (`exec_with_runpath`) and 32-bit
//! (`exec32_with_runpath`) little-endian variants are provided.

const BASE: u64 = 0x400000;
const BASE32: u32 = 0x0804_8000;
const EHSIZE: u64 = 64;
const PHENTSIZE: u64 = 56;
const SHENTSIZE: u64 = 64;
const PHNUM: u64 = 4;
const SHNUM: u64 = 5;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

struct Builder(Vec<u8>);

impl Builder {
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
    fn pad_to(&mut self, offset: u64) {
        assert!(self.0.len() as u64 <= offset);
        self.0.resize(offset as usize, 0);
    }

    fn phdr(&mut self, p_type: u32, flags: u32, offset: u64, filesz: u64, align: u64) {
        self.u32(p_type);
        self.u32(flags);
        self.u64(offset);
        self.u64(BASE + offset); // vaddr
        self.u64(BASE + offset); // paddr
        self.u64(filesz);
        self.u64(filesz);
        self.u64(align);
    }

    #[allow(clippy::too_many_arguments)]
    fn shdr(
        &mut self,
        name: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        align: u64,
        entsize: u64,
    ) {
        self.u32(name);
        self.u32(sh_type);
        self.u64(flags);
        self.u64(addr);
        self.u64(offset);
        self.u64(size);
        self.u32(link);
        self.u32(0);
        self.u64(align);
        self.u64(entsize);
    }
}

/// Build a 64-bit little-endian executable with the given interpreter
/// and `DT_RUNPATH`.
pub fn exec_with_runpath(interp: &str, runpath: &str) -> Vec<u8> {
    let interp_off = EHSIZE + PHNUM * PHENTSIZE;
    let interp_size = interp.len() as u64 + 1;

    let dynstr_off = align8(interp_off + interp_size);
    // Layout: leading NUL, then the runpath string.
    let runpath_str_off = 1u64;
    let dynstr_size = 1 + runpath.len() as u64 + 1;

    let dyn_off = align8(dynstr_off + dynstr_size);
    let dyn_size = 4 * 16u64; // RUNPATH, STRTAB, STRSZ, NULL

    let shstrtab = b"\0.interp\0.dynstr\0.dynamic\0.shstrtab\0";
    let shstrtab_off = dyn_off + dyn_size;
    let shoff = align8(shstrtab_off + shstrtab.len() as u64);
    let total = shoff + SHNUM * SHENTSIZE;

    let mut b = Builder(Vec::with_capacity(total as usize));

    // ELF header
    b.bytes(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    b.bytes(&[0; 8]);
    b.u16(2); // ET_EXEC
    b.u16(0x3e); // EM_X86_64
    b.u32(1);
    b.u64(BASE + 0x1000); // entry, unused
    b.u64(EHSIZE); // phoff
    b.u64(shoff);
    b.u32(0);
    b.u16(EHSIZE as u16);
    b.u16(PHENTSIZE as u16);
    b.u16(PHNUM as u16);
    b.u16(SHENTSIZE as u16);
    b.u16(SHNUM as u16);
    b.u16(4); // shstrndx

    // Program headers: PHDR, INTERP, LOAD, DYNAMIC
    b.phdr(6, 4, EHSIZE, PHNUM * PHENTSIZE, 8);
    b.phdr(3, 4, interp_off, interp_size, 1);
    b.phdr(1, 4, 0, total, 0x1000);
    b.phdr(2, 6, dyn_off, dyn_size, 8);

    // .interp
    b.pad_to(interp_off);
    b.bytes(interp.as_bytes());
    b.bytes(&[0]);

    // .dynstr
    b.pad_to(dynstr_off);
    b.bytes(&[0]);
    b.bytes(runpath.as_bytes());
    b.bytes(&[0]);

    // .dynamic
    b.pad_to(dyn_off);
    for (tag, val) in [
        (29u64, runpath_str_off),     // DT_RUNPATH
        (5, BASE + dynstr_off),       // DT_STRTAB
        (10, dynstr_size),            // DT_STRSZ
        (0, 0),                       // DT_NULL
    ] {
        b.u64(tag);
        b.u64(val);
    }

    // .shstrtab
    b.pad_to(shstrtab_off);
    b.bytes(shstrtab);

    // Section headers
    b.pad_to(shoff);
    b.shdr(0, 0, 0, 0, 0, 0, 0, 0, 0);
    b.shdr(1, 1, 2, BASE + interp_off, interp_off, interp_size, 0, 1, 0); // .interp
    b.shdr(9, 3, 2, BASE + dynstr_off, dynstr_off, dynstr_size, 0, 1, 0); // .dynstr
    b.shdr(17, 6, 3, BASE + dyn_off, dyn_off, dyn_size, 2, 8, 16); // .dynamic
    b.shdr(26, 3, 0, 0, shstrtab_off, shstrtab.len() as u64, 0, 1, 0); // .shstrtab

    assert_eq!(b.0.len() as u64, total);
    b.0
}

impl Builder {
    fn phdr32(&mut self, p_type: u32, flags: u32, offset: u32, filesz: u32, align: u32) {
        self.u32(p_type);
        self.u32(offset);
        self.u32(BASE32 + offset); // vaddr
        self.u32(BASE32 + offset); // paddr
        self.u32(filesz);
        self.u32(filesz);
        self.u32(flags);
        self.u32(align);
    }

    #[allow(clippy::too_many_arguments)]
    fn shdr32(
        &mut self,
        name: u32,
        sh_type: u32,
        flags: u32,
        addr: u32,
        offset: u32,
        size: u32,
        link: u32,
        align: u32,
        entsize: u32,
    ) {
        self.u32(name);
        self.u32(sh_type);
        self.u32(flags);
        self.u32(addr);
        self.u32(offset);
        self.u32(size);
        self.u32(link);
        self.u32(0);
        self.u32(align);
        self.u32(entsize);
    }
}

/// Build a 32-bit little-endian executable with the given interpreter
/// and `DT_RUNPATH`.
pub fn exec32_with_runpath(interp: &str, runpath: &str) -> Vec<u8> {
    const EHSIZE32: u32 = 52;
    const PHENTSIZE32: u32 = 32;
    const SHENTSIZE32: u32 = 40;

    let align8_32 = |n: u32| (n + 7) & !7;

    let interp_off = EHSIZE32 + 4 * PHENTSIZE32;
    let interp_size = interp.len() as u32 + 1;

    let dynstr_off = align8_32(interp_off + interp_size);
    let runpath_str_off = 1u32;
    let dynstr_size = 1 + runpath.len() as u32 + 1;

    let dyn_off = align8_32(dynstr_off + dynstr_size);
    let dyn_size = 4 * 8u32; // RUNPATH, STRTAB, STRSZ, NULL

    let shstrtab = b"\0.interp\0.dynstr\0.dynamic\0.shstrtab\0";
    let shstrtab_off = dyn_off + dyn_size;
    let shoff = align8_32(shstrtab_off + shstrtab.len() as u32);
    let total = shoff + 5 * SHENTSIZE32;

    let mut b = Builder(Vec::with_capacity(total as usize));

    // ELF header
    b.bytes(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    b.bytes(&[0; 8]);
    b.u16(2); // ET_EXEC
    b.u16(3); // EM_386
    b.u32(1);
    b.u32(BASE32 + 0x1000); // entry, unused
    b.u32(EHSIZE32); // phoff
    b.u32(shoff);
    b.u32(0);
    b.u16(EHSIZE32 as u16);
    b.u16(PHENTSIZE32 as u16);
    b.u16(4);
    b.u16(SHENTSIZE32 as u16);
    b.u16(5);
    b.u16(4); // shstrndx

    // Program headers: PHDR, INTERP, LOAD, DYNAMIC
    b.phdr32(6, 4, EHSIZE32, 4 * PHENTSIZE32, 4);
    b.phdr32(3, 4, interp_off, interp_size, 1);
    b.phdr32(1, 4, 0, total, 0x1000);
    b.phdr32(2, 6, dyn_off, dyn_size, 4);

    // .interp
    b.pad_to(interp_off as u64);
    b.bytes(interp.as_bytes());
    b.bytes(&[0]);

    // .dynstr
    b.pad_to(dynstr_off as u64);
    b.bytes(&[0]);
    b.bytes(runpath.as_bytes());
    b.bytes(&[0]);

    // .dynamic
    b.pad_to(dyn_off as u64);
    for (tag, val) in [
        (29u32, runpath_str_off),  // DT_RUNPATH
        (5, BASE32 + dynstr_off),  // DT_STRTAB
        (10, dynstr_size),         // DT_STRSZ
        (0, 0),                    // DT_NULL
    ] {
        b.u32(tag);
        b.u32(val);
    }

    // .shstrtab
    b.pad_to(shstrtab_off as u64);
    b.bytes(shstrtab);

    // Section headers
    b.pad_to(shoff as u64);
    b.shdr32(0, 0, 0, 0, 0, 0, 0, 0, 0);
    b.shdr32(1, 1, 2, BASE32 + interp_off, interp_off, interp_size, 0, 1, 0); // .interp
    b.shdr32(9, 3, 2, BASE32 + dynstr_off, dynstr_off, dynstr_size, 0, 1, 0); // .dynstr
    b.shdr32(17, 6, 3, BASE32 + dyn_off, dyn_off, dyn_size, 2, 4, 8); // .dynamic
    b.shdr32(26, 3, 0, 0, shstrtab_off, shstrtab.len() as u32, 0, 1, 0); // .shstrtab

    assert_eq!(b.0.len() as u32, total);
    b.0
}
