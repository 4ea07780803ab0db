use goblin::elf::dynamic::{DT_RUNPATH, DT_STRSZ};
use goblin::elf::Elf;
use relonar_elf::{fixture, ElfPatchError, ElfPatcher};

fn parse_runpath(data: &[u8]) -> Option<String> {
    let elf = Elf::parse(data).unwrap();
    let dynamic = elf.dynamic.as_ref()?;
    let entry = dynamic.dyns.iter().find(|d| d.d_tag == DT_RUNPATH)?;
    elf.dynstrtab
        .get_at(entry.d_val as usize)
        .map(str::to_owned)
}

fn parse_interpreter(data: &[u8]) -> Option<String> {
    Elf::parse(data).unwrap().interpreter.map(str::to_owned)
}

#[test]
fn rejects_non_elf() {
    assert!(matches!(
        ElfPatcher::new(b"#!/bin/sh\necho hi\n"),
        Err(ElfPatchError::NotElf)
    ));
    assert!(matches!(ElfPatcher::new(b""), Err(ElfPatchError::NotElf)));
}

#[test]
fn reads_interpreter_and_runpath() {
    let image = fixture::exec_with_runpath(
        "/nix/store/abc-glibc/lib/ld-linux-x86-64.so.2",
        "/nix/store/abc-glibc/lib:/nix/store/def-foo/lib",
    );
    let patcher = ElfPatcher::new(&image).unwrap();
    assert_eq!(
        patcher.interpreter(),
        Some("/nix/store/abc-glibc/lib/ld-linux-x86-64.so.2")
    );
    assert_eq!(
        patcher.rpath(),
        Some("/nix/store/abc-glibc/lib:/nix/store/def-foo/lib")
    );
}

#[test]
fn untouched_image_survives_finalize() {
    let image = fixture::exec_with_runpath("/lib/ld.so", "/lib");
    let patcher = ElfPatcher::new(&image).unwrap();
    let out = patcher.finalize().unwrap();
    assert_eq!(out, image);
}

#[test]
fn same_length_rewrite_stays_in_place() {
    let image = fixture::exec_with_runpath(
        "/nix/store/abc-glibc/lib/ld-linux-x86-64.so.2",
        "/nix/store/abc-glibc/lib",
    );
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_interpreter("/nix/store/xyz-glibc/lib/ld-linux-x86-64.so.2");
    patcher.set_rpath("/nix/store/xyz-glibc/lib");
    let out = patcher.finalize().unwrap();

    assert_eq!(out.len(), image.len());
    assert_eq!(
        parse_interpreter(&out).as_deref(),
        Some("/nix/store/xyz-glibc/lib/ld-linux-x86-64.so.2")
    );
    assert_eq!(
        parse_runpath(&out).as_deref(),
        Some("/nix/store/xyz-glibc/lib")
    );
}

#[test]
fn shorter_runpath_stays_in_place_and_taints() {
    let image = fixture::exec_with_runpath("/lib/ld.so", "/nix/store/abc-glibc/lib");
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_rpath("/lib64");
    let out = patcher.finalize().unwrap();

    assert_eq!(out.len(), image.len());
    assert_eq!(parse_runpath(&out).as_deref(), Some("/lib64"));
    // The tail of the old value is overwritten, not left behind.
    assert!(!out.windows(5).any(|w| w == b"glibc"));
}

#[test]
fn growing_runpath_relocates() {
    let image = fixture::exec_with_runpath("/lib/ld.so", "/old");
    let long_runpath =
        "/prefix/nix/store/xyz-glibc/lib:/prefix/nix/store/def-foo/lib:/prefix/nix/store/ghi-bar/lib";
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_rpath(long_runpath);
    let out = patcher.finalize().unwrap();

    assert!(out.len() > image.len());
    assert_eq!(parse_runpath(&out).as_deref(), Some(long_runpath));
    // Interpreter untouched.
    assert_eq!(parse_interpreter(&out).as_deref(), Some("/lib/ld.so"));

    let elf = Elf::parse(&out).unwrap();
    assert_eq!(elf.program_headers.len(), 5);
    let strsz = elf
        .dynamic
        .as_ref()
        .unwrap()
        .dyns
        .iter()
        .find(|d| d.d_tag == DT_STRSZ)
        .unwrap()
        .d_val;
    assert_eq!(strsz, 1 + 4 + 1 + long_runpath.len() as u64 + 1);
}

#[test]
fn growing_interpreter_relocates() {
    let image = fixture::exec_with_runpath("/lib/ld.so", "/lib");
    let long_interp = "/data/data/com.example.nix/files/usr/nix/store/xyz-glibc/lib/ld-linux-x86-64.so.2";
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_interpreter(long_interp);
    let out = patcher.finalize().unwrap();

    assert_eq!(parse_interpreter(&out).as_deref(), Some(long_interp));
    assert_eq!(parse_runpath(&out).as_deref(), Some("/lib"));

    // The new segment keeps offset/vaddr congruence for the loader.
    let elf = Elf::parse(&out).unwrap();
    let load = elf
        .program_headers
        .iter()
        .filter(|p| p.p_type == goblin::elf::program_header::PT_LOAD)
        .last()
        .unwrap();
    assert_eq!(load.p_offset % 0x1000, load.p_vaddr % 0x1000);
}

#[test]
fn elf32_reads_and_same_length_rewrite() {
    let image = fixture::exec32_with_runpath(
        "/nix/store/abc-glibc/lib/ld-linux.so.2",
        "/nix/store/abc-glibc/lib",
    );
    let mut patcher = ElfPatcher::new(&image).unwrap();
    assert_eq!(
        patcher.interpreter(),
        Some("/nix/store/abc-glibc/lib/ld-linux.so.2")
    );
    assert_eq!(patcher.rpath(), Some("/nix/store/abc-glibc/lib"));

    patcher.set_interpreter("/nix/store/xyz-glibc/lib/ld-linux.so.2");
    patcher.set_rpath("/nix/store/xyz-glibc/lib");
    let out = patcher.finalize().unwrap();

    assert_eq!(out.len(), image.len());
    assert_eq!(
        parse_interpreter(&out).as_deref(),
        Some("/nix/store/xyz-glibc/lib/ld-linux.so.2")
    );
    assert_eq!(
        parse_runpath(&out).as_deref(),
        Some("/nix/store/xyz-glibc/lib")
    );
}

#[test]
fn elf32_growth_relocates() {
    let image = fixture::exec32_with_runpath("/lib/ld-linux.so.2", "/old");
    let runpath = "/prefix/nix/store/xyz-glibc/lib:/prefix/nix/store/def-foo/lib";
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_rpath(runpath);
    let out = patcher.finalize().unwrap();

    assert!(out.len() > image.len());
    assert_eq!(parse_runpath(&out).as_deref(), Some(runpath));
    assert_eq!(parse_interpreter(&out).as_deref(), Some("/lib/ld-linux.so.2"));

    let elf = Elf::parse(&out).unwrap();
    assert!(!elf.is_64);
    assert_eq!(elf.program_headers.len(), 5);
}

#[test]
fn growing_both_relocates_both() {
    let image = fixture::exec_with_runpath("/lib/ld.so", "/old");
    let interp = "/very/long/prefix/nix/store/xyz-glibc/lib/ld-linux-x86-64.so.2";
    let runpath = "/very/long/prefix/nix/store/xyz-glibc/lib:/very/long/prefix/nix/store/def-foo/lib";
    let mut patcher = ElfPatcher::new(&image).unwrap();
    patcher.set_interpreter(interp);
    patcher.set_rpath(runpath);
    let out = patcher.finalize().unwrap();

    assert_eq!(parse_interpreter(&out).as_deref(), Some(interp));
    assert_eq!(parse_runpath(&out).as_deref(), Some(runpath));
}
