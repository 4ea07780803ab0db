use goblin::container::{Container, Ctx};
use goblin::elf::dynamic::{Dyn, DT_NULL, DT_RPATH, DT_RUNPATH, DT_STRSZ, DT_STRTAB};
use goblin::elf::header::Header;
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_PHDR};
use goblin::elf::section_header::{SectionHeader, SHT_DYNAMIC, SHT_STRTAB};
use goblin::elf::Elf;
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::Endian;
use tracing::{debug, trace};

use crate::ElfPatchError;

const PAGE_SIZE: u64 = 0x1000;

const fn align8(n: u64) -> u64 {
    n.wrapping_add(7) & !7
}

const fn align_page(n: u64) -> u64 {
    n.wrapping_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Length of the NUL-terminated string at `offset`, terminator included.
fn cstr_len(table: &[u8], offset: usize) -> usize {
    let mut end = offset;
    while end < table.len() && table[end] != 0 {
        end += 1;
    }
    end - offset + 1
}

/// A parsed ELF image plus pending interpreter/RPATH replacements.
pub struct ElfPatcher {
    data: Vec<u8>,
    ctx: Ctx,
    header: Header,
    phdrs: Vec<ProgramHeader>,
    shdrs: Vec<SectionHeader>,
    dyns: Vec<Dyn>,
    dynstr: Vec<u8>,
    dynstr_offset: usize,
    dynstr_size: usize,
    interpreter: Option<String>,
    rpath: Option<String>,
    rpath_idx: Option<usize>,
    new_interpreter: Option<String>,
    new_rpath: Option<String>,
}

impl ElfPatcher {
    /// Parse an image. Inputs without the ELF magic are rejected as
    /// [`ElfPatchError::NotElf`]; anything carrying the magic that fails
    /// to parse is [`ElfPatchError::Malformed`].
    pub fn new(data: &[u8]) -> Result<Self, ElfPatchError> {
        if data.len() < 4 || &data[..4] != b"\x7fELF" {
            return Err(ElfPatchError::NotElf);
        }

        let elf = Elf::parse(data)?;
        let ctx = Ctx::new(
            if elf.is_64 {
                Container::Big
            } else {
                Container::Little
            },
            if elf.little_endian {
                Endian::Little
            } else {
                Endian::Big
            },
        );

        let mut dyns = Vec::new();
        let mut dynstr = Vec::new();
        let mut dynstr_offset = 0;
        let mut dynstr_size = 0;
        if let Some(ref dynamic) = elf.dynamic {
            dyns = dynamic.dyns.clone();
            dynstr_offset = dynamic.info.strtab;
            dynstr_size = dynamic.info.strsz;
            if dynstr_offset
                .checked_add(dynstr_size)
                .is_some_and(|end| end <= data.len())
            {
                dynstr.extend_from_slice(&data[dynstr_offset..dynstr_offset + dynstr_size]);
            } else {
                return Err(ElfPatchError::Malformed(
                    "dynamic string table out of bounds".into(),
                ));
            }
        }

        let rpath_idx = dyns
            .iter()
            .position(|d| d.d_tag == DT_RUNPATH)
            .or_else(|| dyns.iter().position(|d| d.d_tag == DT_RPATH));
        let rpath = rpath_idx.and_then(|idx| {
            let offset = dyns[idx].d_val as usize;
            if offset >= dynstr.len() {
                return None;
            }
            let len = cstr_len(&dynstr, offset) - 1;
            std::str::from_utf8(&dynstr[offset..offset + len])
                .ok()
                .map(str::to_owned)
        });

        Ok(Self {
            data: data.to_vec(),
            ctx,
            header: elf.header,
            phdrs: elf.program_headers.clone(),
            shdrs: elf.section_headers.clone(),
            dyns,
            dynstr,
            dynstr_offset,
            dynstr_size,
            interpreter: elf.interpreter.map(str::to_owned),
            rpath,
            rpath_idx,
            new_interpreter: None,
            new_rpath: None,
        })
    }

    /// The `PT_INTERP` string, if the image has one.
    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    /// The `DT_RUNPATH` value, falling back to `DT_RPATH`.
    pub fn rpath(&self) -> Option<&str> {
        self.rpath.as_deref()
    }

    /// Replace the interpreter. Only meaningful when [`Self::interpreter`]
    /// returned `Some`.
    pub fn set_interpreter(&mut self, interpreter: &str) {
        self.new_interpreter = Some(interpreter.to_owned());
    }

    /// Replace the RPATH/RUNPATH value, keeping whichever dynamic tag the
    /// image already uses. Only meaningful when [`Self::rpath`] returned
    /// `Some`.
    pub fn set_rpath(&mut self, rpath: &str) {
        self.new_rpath = Some(rpath.to_owned());
    }

    /// Apply the pending replacements and return the rewritten image.
    pub fn finalize(mut self) -> Result<Vec<u8>, ElfPatchError> {
        let mut dynstr_grown = false;

        if let Some(rpath) = self.new_rpath.take() {
            let idx = self.rpath_idx.ok_or_else(|| {
                ElfPatchError::RewriteFailed("no RPATH/RUNPATH entry to rewrite".into())
            })?;
            let old_offset = self.dyns[idx].d_val as usize;
            if old_offset >= self.dynstr.len() {
                return Err(ElfPatchError::RewriteFailed(
                    "RPATH string offset out of bounds".into(),
                ));
            }
            let old_len = cstr_len(&self.dynstr, old_offset);
            let new_len = rpath.len() + 1;

            // Taint the old value before overwriting or abandoning it, so
            // no stale search path survives in the string table.
            let taint_end = (old_offset + old_len - 1).min(self.dynstr.len());
            self.dynstr[old_offset..taint_end].fill(b'X');

            // An unterminated table (no NUL before the end) forces the
            // append path; writing in place would run past it.
            if new_len <= old_len && old_offset + old_len <= self.dynstr.len() {
                self.dynstr[old_offset..old_offset + rpath.len()]
                    .copy_from_slice(rpath.as_bytes());
                self.dynstr[old_offset + rpath.len()] = 0;
            } else {
                let offset = self.dynstr.len();
                self.dynstr.extend_from_slice(rpath.as_bytes());
                self.dynstr.push(0);
                self.dyns[idx].d_val = offset as u64;
                dynstr_grown = true;
            }
            trace!(offset = old_offset, grown = dynstr_grown, "rewrote RPATH");
        }

        let interp_fits = match &self.new_interpreter {
            Some(interp) => {
                let phdr = self
                    .phdrs
                    .iter()
                    .find(|p| p.p_type == PT_INTERP)
                    .ok_or_else(|| {
                        ElfPatchError::RewriteFailed("no PT_INTERP segment to rewrite".into())
                    })?;
                if phdr
                    .p_offset
                    .checked_add(phdr.p_filesz)
                    .map_or(true, |end| end > self.data.len() as u64)
                {
                    return Err(ElfPatchError::RewriteFailed(
                        "PT_INTERP segment out of bounds".into(),
                    ));
                }
                interp.len() as u64 + 1 <= phdr.p_filesz
            }
            None => true,
        };

        if dynstr_grown || !interp_fits {
            self.relocate()
        } else {
            self.rewrite_in_place()
        }
    }

    /// Everything fits where it already lives: overwrite strings, then
    /// refresh the header tables that describe them.
    fn rewrite_in_place(mut self) -> Result<Vec<u8>, ElfPatchError> {
        let mut out = std::mem::take(&mut self.data);

        if self.dynstr_size > 0 {
            out[self.dynstr_offset..self.dynstr_offset + self.dynstr_size]
                .copy_from_slice(&self.dynstr[..self.dynstr_size]);
        }

        if let Some(interp) = self.new_interpreter.take() {
            let idx = self
                .phdrs
                .iter()
                .position(|p| p.p_type == PT_INTERP)
                .expect("checked in finalize");
            let offset = self.phdrs[idx].p_offset as usize;
            let old_size = self.phdrs[idx].p_filesz as usize;
            let new_size = interp.len() + 1;

            out[offset..offset + interp.len()].copy_from_slice(interp.as_bytes());
            out[offset + interp.len()..offset + old_size].fill(0);

            self.phdrs[idx].p_filesz = new_size as u64;
            self.phdrs[idx].p_memsz = new_size as u64;
            for shdr in &mut self.shdrs {
                if shdr.sh_offset as usize == offset && shdr.sh_size as usize == old_size {
                    shdr.sh_size = new_size as u64;
                }
            }

            write_phdrs(&mut out, self.header.e_phoff as usize, &self.phdrs, self.ctx)?;
            write_shdrs(&mut out, self.header.e_shoff as usize, &self.shdrs, self.ctx)?;
        }

        Ok(out)
    }

    /// A replacement outgrew its slot: move the program-header table,
    /// `.interp`, `.dynstr` and `.dynamic` into one new page-aligned
    /// `PT_LOAD` appended at the end of the image.
    fn relocate(mut self) -> Result<Vec<u8>, ElfPatchError> {
        let phentsize = ProgramHeader::size_with(&self.ctx) as u64;
        let dynentsize = Dyn::size_with(&self.ctx) as u64;

        let old_interp = self
            .phdrs
            .iter()
            .find(|p| p.p_type == PT_INTERP)
            .map(|p| (p.p_offset as usize, p.p_filesz as usize));
        let new_interp = self.new_interpreter.take();
        let relocate_interp = match (&new_interp, old_interp) {
            (Some(interp), Some((_, old_size))) => interp.len() + 1 > old_size,
            _ => false,
        };

        // Lay the new segment out: phdr table first, then the strings,
        // then the dynamic array, each 8-aligned.
        let seg_start = align8(self.data.len() as u64);
        let phtab_off = seg_start;
        let phtab_size = (self.phdrs.len() as u64 + 1) * phentsize;
        let mut cursor = phtab_off + phtab_size;

        let interp_seg = match (&new_interp, relocate_interp) {
            (Some(interp), true) => {
                cursor = align8(cursor);
                let off = cursor;
                let size = interp.len() as u64 + 1;
                cursor += size;
                Some((off, size))
            }
            _ => None,
        };

        cursor = align8(cursor);
        let dynstr_off = cursor;
        cursor += self.dynstr.len() as u64;

        // The relocated dynamic array must stay DT_NULL-terminated.
        if self.dyns.last().map_or(true, |d| d.d_tag != DT_NULL) {
            self.dyns.push(Dyn {
                d_tag: DT_NULL,
                d_val: 0,
            });
        }

        cursor = align8(cursor);
        let dyn_off = cursor;
        let dyn_size = self.dyns.len() as u64 * dynentsize;
        cursor += dyn_size;

        let seg_size = cursor - seg_start;

        // Place the segment above every existing PT_LOAD, keeping the
        // offset/vaddr congruence the loader requires.
        let max_vaddr = self
            .phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| p.p_vaddr + p.p_memsz)
            .max()
            .ok_or_else(|| ElfPatchError::RewriteFailed("no PT_LOAD segment".into()))?;
        let seg_vaddr = align_page(max_vaddr) + (seg_start % PAGE_SIZE);
        let map = |off: u64| seg_vaddr + (off - seg_start);

        debug!(
            seg_start,
            seg_size, seg_vaddr, relocate_interp, "relocating ELF metadata"
        );

        let mut out = std::mem::take(&mut self.data);
        out.resize(cursor as usize, 0);

        // Taint the abandoned string table so stale paths cannot be
        // picked up by tools that read sections by offset.
        out[self.dynstr_offset..self.dynstr_offset + self.dynstr_size].fill(b'X');

        for dyn_entry in &mut self.dyns {
            match dyn_entry.d_tag {
                DT_STRTAB => dyn_entry.d_val = map(dynstr_off),
                DT_STRSZ => dyn_entry.d_val = self.dynstr.len() as u64,
                _ => {}
            }
        }

        for phdr in &mut self.phdrs {
            match phdr.p_type {
                PT_PHDR => {
                    phdr.p_offset = phtab_off;
                    phdr.p_vaddr = map(phtab_off);
                    phdr.p_paddr = map(phtab_off);
                    phdr.p_filesz = phtab_size;
                    phdr.p_memsz = phtab_size;
                }
                PT_INTERP => {
                    if let Some((off, size)) = interp_seg {
                        phdr.p_offset = off;
                        phdr.p_vaddr = map(off);
                        phdr.p_paddr = map(off);
                        phdr.p_filesz = size;
                        phdr.p_memsz = size;
                    }
                }
                PT_DYNAMIC => {
                    phdr.p_offset = dyn_off;
                    phdr.p_vaddr = map(dyn_off);
                    phdr.p_paddr = map(dyn_off);
                    phdr.p_filesz = dyn_size;
                    phdr.p_memsz = dyn_size;
                }
                _ => {}
            }
        }
        self.phdrs.push(ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: seg_start,
            p_vaddr: seg_vaddr,
            p_paddr: seg_vaddr,
            p_filesz: seg_size,
            p_memsz: seg_size,
            p_align: PAGE_SIZE,
        });

        // An interpreter replacement that still fits stays in the old
        // segment even when the string table moves.
        if let (Some(interp), Some((offset, old_size)), false) =
            (&new_interp, old_interp, relocate_interp)
        {
            out[offset..offset + interp.len()].copy_from_slice(interp.as_bytes());
            out[offset + interp.len()..offset + old_size].fill(0);
            let new_size = interp.len() + 1;
            for phdr in &mut self.phdrs {
                if phdr.p_type == PT_INTERP {
                    phdr.p_filesz = new_size as u64;
                    phdr.p_memsz = new_size as u64;
                }
            }
            for shdr in &mut self.shdrs {
                if shdr.sh_offset as usize == offset && shdr.sh_size as usize == old_size {
                    shdr.sh_size = new_size as u64;
                }
            }
        }

        // Section headers follow their contents to the new segment.
        for shdr in &mut self.shdrs {
            if shdr.sh_type == SHT_STRTAB && shdr.sh_offset as usize == self.dynstr_offset {
                shdr.sh_offset = dynstr_off;
                shdr.sh_addr = map(dynstr_off);
                shdr.sh_size = self.dynstr.len() as u64;
                shdr.sh_addralign = 8;
            } else if shdr.sh_type == SHT_DYNAMIC {
                shdr.sh_offset = dyn_off;
                shdr.sh_addr = map(dyn_off);
                shdr.sh_size = dyn_size;
            } else if let (Some((offset, size)), Some((new_off, new_size))) =
                (old_interp, interp_seg)
            {
                if shdr.sh_offset as usize == offset && shdr.sh_size as usize == size {
                    shdr.sh_offset = new_off;
                    shdr.sh_addr = map(new_off);
                    shdr.sh_size = new_size;
                }
            }
        }

        if let (Some(interp), Some((off, _))) = (&new_interp, interp_seg) {
            let off = off as usize;
            out[off..off + interp.len()].copy_from_slice(interp.as_bytes());
            out[off + interp.len()] = 0;
        }
        out[dynstr_off as usize..dynstr_off as usize + self.dynstr.len()]
            .copy_from_slice(&self.dynstr);
        for (i, dyn_entry) in self.dyns.iter().enumerate() {
            let pos = (dyn_off + i as u64 * dynentsize) as usize;
            dyn_entry
                .clone()
                .try_into_ctx(&mut out[pos..], self.ctx)
                .map_err(rewrite_err)?;
        }

        write_phdrs(&mut out, phtab_off as usize, &self.phdrs, self.ctx)?;
        write_shdrs(&mut out, self.header.e_shoff as usize, &self.shdrs, self.ctx)?;

        self.header.e_phoff = phtab_off;
        self.header.e_phnum = self.phdrs.len() as u16;
        self.header
            .try_into_ctx(&mut out[..], self.ctx.le)
            .map_err(rewrite_err)?;

        Ok(out)
    }
}

fn rewrite_err(err: goblin::error::Error) -> ElfPatchError {
    ElfPatchError::RewriteFailed(err.to_string())
}

fn write_phdrs(
    out: &mut [u8],
    offset: usize,
    phdrs: &[ProgramHeader],
    ctx: Ctx,
) -> Result<(), ElfPatchError> {
    let entsize = ProgramHeader::size_with(&ctx);
    for (i, phdr) in phdrs.iter().enumerate() {
        phdr.clone()
            .try_into_ctx(&mut out[offset + i * entsize..], ctx)
            .map_err(rewrite_err)?;
    }
    Ok(())
}

fn write_shdrs(
    out: &mut [u8],
    offset: usize,
    shdrs: &[SectionHeader],
    ctx: Ctx,
) -> Result<(), ElfPatchError> {
    let entsize = SectionHeader::size_with(&ctx);
    for (i, shdr) in shdrs.iter().enumerate() {
        shdr.clone()
            .try_into_ctx(&mut out[offset + i * entsize..], ctx)
            .map_err(rewrite_err)?;
    }
    Ok(())
}
