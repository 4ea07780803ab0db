use std::sync::atomic::{AtomicU64, Ordering};

use bstr::{BStr, ByteSlice};
use relonar_elf::{ElfPatchError, ElfPatcher};
use tracing::debug;

use crate::classify;
use crate::mappings::basename;
use crate::settings::replace_all;
use crate::{Highlighter, Language, RewriteSettings, Span, SpanKind, STORE_PREFIX};

/// Run counters, updated with relaxed atomics from the worker pool.
#[derive(Debug, Default)]
pub struct Stats {
    files_patched: AtomicU64,
    symlinks_patched: AtomicU64,
    directories_processed: AtomicU64,
    total_bytes: AtomicU64,
}

impl Stats {
    pub fn files_patched(&self) -> u64 {
        self.files_patched.load(Ordering::Relaxed)
    }
    pub fn symlinks_patched(&self) -> u64 {
        self.symlinks_patched.load(Ordering::Relaxed)
    }
    pub fn directories_processed(&self) -> u64 {
        self.directories_processed.load(Ordering::Relaxed)
    }
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

/// The per-leaf rewriting kernel.
///
/// Pure apart from the statistics counters: the same input bytes,
/// executable flag and path always produce the same output bytes, which
/// is what lets leaves be patched out of order by a worker pool.
pub struct Patcher {
    settings: RewriteSettings,
    highlighter: Highlighter,
    stats: Stats,
}

impl Patcher {
    pub fn new(settings: RewriteSettings, highlighter: Highlighter) -> Self {
        Self {
            settings,
            highlighter,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn note_directory(&self) {
        self.stats
            .directories_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Rewrite one regular file. Dispatch, first match wins: ELF, skip
    /// extension, extension-classified source, oversized plain text,
    /// shebang-classified source, shebang-only, opaque. The mapping
    /// table applies to every outcome.
    pub fn patch_file(&self, contents: &[u8], executable: bool, path: &str) -> Vec<u8> {
        self.stats
            .total_bytes
            .fetch_add(contents.len() as u64, Ordering::Relaxed);
        let filename = path.rsplit('/').next().unwrap_or(path).as_bytes();

        let mut out = if contents.starts_with(b"\x7fELF") {
            debug!(path, size = contents.len(), executable, "patching ELF");
            self.patch_elf(contents, path)
        } else if classify::is_skip_extension(filename) {
            debug!(path, "skipping by extension");
            contents.to_vec()
        } else if let Some(lang) = classify::by_extension(filename) {
            debug!(path, %lang, "patching source");
            self.patch_source(contents, lang, path)
        } else if contents.len() > classify::MAX_CLASSIFY_SIZE {
            debug!(path, size = contents.len(), "skipping oversized plain file");
            contents.to_vec()
        } else if let Some(lang) = classify::from_shebang(contents) {
            debug!(path, %lang, "patching source (shebang classified)");
            self.patch_source(contents, lang, path)
        } else if classify::has_shebang(contents) {
            debug!(path, "rewriting shebang only");
            self.patch_spans(contents.to_vec(), vec![shebang_span(contents)])
        } else {
            contents.to_vec()
        };

        self.settings.mappings.apply(&mut out);
        if out != contents {
            self.stats.files_patched.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    /// Rewrite one symlink target. Same composition as a whole path,
    /// with one extra wrinkle: a relative target that mentions the old
    /// glibc basename (but not the full store path) has the basename
    /// substituted.
    pub fn patch_symlink(&self, target: &[u8], path: &str) -> Vec<u8> {
        let s = &self.settings;
        let mut out = target.to_vec();

        if s.glibc_enabled() {
            if out.find(&s.old_glibc).is_some() {
                replace_all(&mut out, &s.old_glibc, &s.new_glibc);
            } else {
                let old_base = basename(&s.old_glibc);
                let new_base = basename(&s.new_glibc);
                if !old_base.is_empty() && out.find(old_base).is_some() {
                    replace_all(&mut out, old_base, new_base);
                }
            }
        }

        s.mappings.apply(&mut out);

        if !s.prefix.is_empty() && out.starts_with(STORE_PREFIX) {
            let mut prefixed = Vec::with_capacity(s.prefix.len() + out.len());
            prefixed.extend_from_slice(&s.prefix);
            prefixed.extend_from_slice(&out);
            out = prefixed;
        }

        if out != target {
            debug!(path, old = %BStr::new(target), new = %BStr::new(&out), "symlink");
            self.stats.symlinks_patched.fetch_add(1, Ordering::Relaxed);
        }
        out
    }

    fn patch_elf(&self, contents: &[u8], path: &str) -> Vec<u8> {
        match self.try_patch_elf(contents) {
            Ok(out) => out,
            Err(ElfPatchError::NotElf) => contents.to_vec(),
            Err(err) => {
                debug!(path, %err, "ELF rewrite failed, keeping original bytes");
                contents.to_vec()
            }
        }
    }

    fn try_patch_elf(&self, contents: &[u8]) -> Result<Vec<u8>, ElfPatchError> {
        let mut patcher = ElfPatcher::new(contents)?;

        if let Some(interp) = patcher.interpreter().map(str::to_owned) {
            let new_interp = self.transform_path_str(&interp);
            if new_interp != interp {
                debug!(old = %interp, new = %new_interp, "interpreter");
                patcher.set_interpreter(&new_interp);
            }
        }

        if let Some(rpath) = patcher.rpath().map(str::to_owned) {
            let new_rpath = rpath
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(|entry| self.transform_path_str(entry))
                .collect::<Vec<_>>()
                .join(":");
            if new_rpath != rpath {
                debug!(old = %rpath, new = %new_rpath, "rpath");
                patcher.set_rpath(&new_rpath);
            }
        }

        patcher.finalize()
    }

    fn transform_path_str(&self, path: &str) -> String {
        String::from_utf8_lossy(&self.settings.transform_path(path.as_bytes())).into_owned()
    }

    fn patch_source(&self, contents: &[u8], lang: Language, path: &str) -> Vec<u8> {
        // The tokenizer wants text; treat undecodable content like a
        // tokenizer failure and fall back to the shebang line.
        let spans = match std::str::from_utf8(contents) {
            Ok(text) => self.highlighter.spans(text, lang),
            Err(err) => Err(crate::TokenizeError::Parse(err.to_string())),
        };

        match spans {
            Ok(spans) => {
                let spans = with_shebang_span(contents, spans);
                self.patch_spans(contents.to_vec(), spans)
            }
            Err(err) => {
                debug!(path, %lang, %err, "tokenizer unavailable, shebang-only");
                if classify::has_shebang(contents) {
                    self.patch_spans(contents.to_vec(), vec![shebang_span(contents)])
                } else {
                    contents.to_vec()
                }
            }
        }
    }

    /// One left-to-right pass over the spanned regions. At each offset
    /// the alternatives are tried in the load-bearing order: glibc
    /// substitution, mapping table, store prefix, extra patterns (the
    /// last inside string literals only). Insertions and unequal-length
    /// substitutions shift every downstream span.
    fn patch_spans(&self, mut content: Vec<u8>, mut spans: Vec<Span>) -> Vec<u8> {
        let s = &self.settings;
        let mut si = 0;

        while si < spans.len() {
            let mut p = spans[si].start;
            while p < spans[si].end {
                if s.glibc_enabled() && content[p..].starts_with(&s.old_glibc) {
                    content.splice(p..p + s.old_glibc.len(), s.new_glibc.iter().copied());
                    let delta = s.new_glibc.len() as isize - s.old_glibc.len() as isize;
                    shift_spans(&mut spans, si, delta);
                    // The substituted path is still a store path; it gets
                    // the prefix at the same site.
                    if !s.prefix.is_empty()
                        && content[p..].starts_with(STORE_PREFIX)
                        && !preceded_by(&content, p, &s.prefix)
                    {
                        insert_at(&mut content, p, &s.prefix);
                        shift_spans(&mut spans, si, s.prefix.len() as isize);
                        p += s.prefix.len();
                    }
                    p += s.new_glibc.len();
                    continue;
                }

                if let Some(new) = s.mappings.match_at(&content, p) {
                    let len = new.len();
                    content[p..p + len].copy_from_slice(new);
                    p += len;
                    continue;
                }

                if !s.prefix.is_empty()
                    && content[p..].starts_with(STORE_PREFIX)
                    && !preceded_by(&content, p, &s.prefix)
                {
                    insert_at(&mut content, p, &s.prefix);
                    shift_spans(&mut spans, si, s.prefix.len() as isize);
                    p += s.prefix.len() + STORE_PREFIX.len();
                    continue;
                }

                if spans[si].kind == SpanKind::StringLiteral && !s.prefix.is_empty() {
                    let matched = s
                        .extra_prefix_patterns
                        .iter()
                        .find(|pat| {
                            content[p..].starts_with(pat.as_slice())
                                && !preceded_by(&content, p, &s.prefix)
                        })
                        .map(|pat| pat.len());
                    if let Some(pat_len) = matched {
                        insert_at(&mut content, p, &s.prefix);
                        shift_spans(&mut spans, si, s.prefix.len() as isize);
                        p += s.prefix.len() + pat_len;
                        continue;
                    }
                }

                p += 1;
            }
            si += 1;
        }
        content
    }
}

/// The first line as one implicit comment span.
fn shebang_span(content: &[u8]) -> Span {
    Span {
        start: 0,
        end: content.find_byte(b'\n').unwrap_or(content.len()),
        kind: SpanKind::Comment,
    }
}

/// Prepend the shebang line as a comment span, clipping tokenizer spans
/// so the result stays ascending and non-overlapping.
fn with_shebang_span(content: &[u8], spans: Vec<Span>) -> Vec<Span> {
    if !classify::has_shebang(content) {
        return spans;
    }
    let shebang = shebang_span(content);
    let mut out = vec![shebang];
    for span in spans {
        if span.end <= shebang.end {
            continue;
        }
        out.push(Span {
            start: span.start.max(shebang.end),
            end: span.end,
            kind: span.kind,
        });
    }
    out
}

/// Shift the current span's end and every later span by `delta` after
/// an insertion or unequal-length substitution.
fn shift_spans(spans: &mut [Span], current: usize, delta: isize) {
    if delta == 0 {
        return;
    }
    spans[current].end = offset(spans[current].end, delta);
    for span in &mut spans[current + 1..] {
        span.start = offset(span.start, delta);
        span.end = offset(span.end, delta);
    }
}

fn offset(value: usize, delta: isize) -> usize {
    (value as isize + delta) as usize
}

fn insert_at(content: &mut Vec<u8>, pos: usize, insert: &[u8]) {
    content.splice(pos..pos, insert.iter().copied());
}

fn preceded_by(content: &[u8], pos: usize, prefix: &[u8]) -> bool {
    !prefix.is_empty() && pos >= prefix.len() && &content[pos - prefix.len()..pos] == prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MappingTable;

    fn patcher(settings: RewriteSettings) -> Patcher {
        Patcher::new(settings, Highlighter::new())
    }

    fn glibc_settings() -> RewriteSettings {
        RewriteSettings {
            prefix: b"/p".to_vec(),
            old_glibc: b"/nix/store/abc-glibc".to_vec(),
            new_glibc: b"/nix/store/xyz-glibc".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn symlink_absolute_glibc() {
        let p = patcher(glibc_settings());
        assert_eq!(
            p.patch_symlink(b"/nix/store/abc-glibc/lib/ld.so", "lib/ld.so"),
            b"/p/nix/store/xyz-glibc/lib/ld.so"
        );
        assert_eq!(p.stats().symlinks_patched(), 1);
    }

    #[test]
    fn symlink_relative_glibc_basename() {
        let p = patcher(glibc_settings());
        assert_eq!(
            p.patch_symlink(b"../../abc-glibc/lib/libc.so.6", "lib/libc.so.6"),
            b"../../xyz-glibc/lib/libc.so.6".to_vec()
        );
    }

    #[test]
    fn symlink_is_idempotent() {
        let p = patcher(glibc_settings());
        let once = p.patch_symlink(b"/nix/store/abc-glibc/lib/ld.so", "l");
        let twice = p.patch_symlink(&once, "l");
        assert_eq!(once, twice);
    }

    #[test_log::test]
    fn shebang_is_prefixed() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let p = patcher(settings);

        let out = p.patch_file(b"#!/nix/store/abc-bash/bin/bash\necho hi\n", true, "foo.sh");
        assert_eq!(&out[..], b"#!/p/nix/store/abc-bash/bin/bash\necho hi\n");
        assert_eq!(p.stats().files_patched(), 1);
    }

    #[test_log::test]
    fn shebang_rewrites_every_occurrence() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let p = patcher(settings);

        // Interpreter argument paths on the same line are rewritten too,
        // not just the line-leading one.
        let out = p.patch_file(
            b"#!/nix/store/abc-bash/bin/bash -x /nix/store/abc-coreutils/bin/env\necho hi\n",
            true,
            "foo.sh",
        );
        assert_eq!(
            &out[..],
            b"#!/p/nix/store/abc-bash/bin/bash -x /p/nix/store/abc-coreutils/bin/env\necho hi\n"
        );
    }

    #[test]
    fn shebang_rewrite_is_idempotent() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let p = patcher(settings);

        let once = p.patch_file(b"#!/nix/store/abc-bash/bin/bash\necho hi\n", true, "foo.sh");
        let twice = p.patch_file(&once, true, "foo.sh");
        assert_eq!(once, twice);
    }

    #[test_log::test]
    fn extra_patterns_apply_in_string_literals() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        settings.extra_prefix_patterns = vec![b"/nix/var/".to_vec()];
        let p = patcher(settings);

        let out = p.patch_file(b"#!/bin/sh\nX=\"/nix/var/log\"\n", true, "foo.sh");
        assert_eq!(&out[..], b"#!/bin/sh\nX=\"/p/nix/var/log\"\n");
    }

    #[test]
    fn extra_patterns_do_not_apply_in_comments() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        settings.extra_prefix_patterns = vec![b"/nix/var/".to_vec()];
        let p = patcher(settings);

        let out = p.patch_file(
            b"#!/bin/sh\n# logs in /nix/var/log\nX=\"/nix/var/cache\"\n",
            true,
            "foo.sh",
        );
        assert_eq!(
            &out[..],
            b"#!/bin/sh\n# logs in /nix/var/log\nX=\"/p/nix/var/cache\"\n"
        );
    }

    #[test]
    fn skip_extension_gets_mapping_only() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let mut mappings = MappingTable::new();
        mappings.insert(b"/nix/store/abc-foo", b"/nix/store/abc-bar");
        settings.mappings = mappings;
        let p = patcher(settings);

        let out = p.patch_file(b"<a href=\"/nix/store/abc-foo/x\">", false, "doc/readme.html");
        // No prefixing, but the mapping applied.
        assert_eq!(&out[..], b"<a href=\"/nix/store/abc-bar/x\">");
    }

    #[test]
    fn oversized_extensionless_file_is_left_alone() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let p = patcher(settings);

        let mut contents = b"#!/bin/sh\n".to_vec();
        contents.resize(classify::MAX_CLASSIFY_SIZE + 1, b'x');
        let out = p.patch_file(&contents, false, "blob");
        assert_eq!(out, contents);
    }

    #[test]
    fn glibc_wins_over_mapping_and_prefix() {
        let mut settings = glibc_settings();
        let mut mappings = MappingTable::new();
        // A mapping that would also hit the glibc path must lose.
        mappings.insert(b"/nix/store/abc-glibc", b"/nix/store/qqq-glibc");
        settings.mappings = mappings;
        let p = patcher(settings);

        let out = p.patch_file(
            b"#!/nix/store/abc-glibc/bin/ld.so\n",
            true,
            "script",
        );
        assert_eq!(&out[..], b"#!/p/nix/store/xyz-glibc/bin/ld.so\n");
    }

    #[test]
    fn opaque_file_gets_mapping_only() {
        let mut settings = RewriteSettings::default();
        settings.prefix = b"/p".to_vec();
        let mut mappings = MappingTable::new();
        mappings.insert(b"/nix/store/aaa-foo", b"/nix/store/bbb-foo");
        settings.mappings = mappings;
        let p = patcher(settings);

        let out = p.patch_file(b"\x00\x01 aaa-foo \x02", false, "data.bin");
        assert_eq!(&out[..], b"\x00\x01 bbb-foo \x02");
    }

    #[test_log::test]
    fn elf_interpreter_and_rpath_are_transformed() {
        let image = relonar_elf::fixture::exec_with_runpath(
            "/nix/store/abc-glibc/lib/ld-linux-x86-64.so.2",
            "/nix/store/abc-glibc/lib:/nix/store/def-foo/lib",
        );
        let p = patcher(glibc_settings());
        let out = p.patch_file(&image, true, "bin/hello");
        assert_ne!(out, image);

        let reparsed = ElfPatcher::new(&out).unwrap();
        assert_eq!(
            reparsed.interpreter(),
            Some("/p/nix/store/xyz-glibc/lib/ld-linux-x86-64.so.2")
        );
        assert_eq!(
            reparsed.rpath(),
            Some("/p/nix/store/xyz-glibc/lib:/p/nix/store/def-foo/lib")
        );
        assert_eq!(p.stats().files_patched(), 1);
    }

    #[test]
    fn broken_elf_passes_through_unchanged() {
        let p = patcher(glibc_settings());
        let contents = b"\x7fELF and then garbage that cannot parse";
        assert_eq!(p.patch_file(contents, true, "bin/broken"), contents.to_vec());
    }

    #[test]
    fn identity_settings_change_nothing() {
        let p = patcher(RewriteSettings::default());
        let contents = b"#!/nix/store/abc-bash/bin/bash\necho /nix/store/abc-foo\n";
        assert_eq!(p.patch_file(contents, true, "foo.sh"), contents.to_vec());
        assert_eq!(p.stats().files_patched(), 0);
    }
}
