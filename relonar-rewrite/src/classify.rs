//! Filename and content based language classification.
//!
//! The fast path is a fixed extension table. Files without a
//! classifying extension fall back to shebang inference, capped at
//! 64 KiB: anything larger and extensionless is data, not a script.

use std::fmt;

use bstr::ByteSlice;

/// The closed whitelist of languages worth tokenizing for string
/// literal patching: places where store paths show up in scripts and
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Sh,
    Zsh,
    Python,
    Perl,
    Ruby,
    Lua,
    Tcl,
    Javascript,
    Json,
    Conf,
    Desktop,
    Properties,
    Ini,
    Makefile,
    M4,
    Xml,
    Awk,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Sh => "sh",
            Language::Zsh => "zsh",
            Language::Python => "python",
            Language::Perl => "perl",
            Language::Ruby => "ruby",
            Language::Lua => "lua",
            Language::Tcl => "tcl",
            Language::Javascript => "javascript",
            Language::Json => "json",
            Language::Conf => "conf",
            Language::Desktop => "desktop",
            Language::Properties => "properties",
            Language::Ini => "ini",
            Language::Makefile => "makefile",
            Language::M4 => "m4",
            Language::Xml => "xml",
            Language::Awk => "awk",
        };
        f.write_str(name)
    }
}

/// Upper bound for content-based classification. Scripts that need
/// patching are small; large extensionless files are data or binaries.
pub const MAX_CLASSIFY_SIZE: usize = 64 * 1024;

/// Extensions that never need patching: documentation, images,
/// archives, fonts and build artifacts. Only the mapping table applies.
const SKIP_EXTENSIONS: &[&str] = &[
    "html", "htm", "xhtml", "css", "svg", // documentation
    "png", "jpg", "jpeg", "gif", "ico", "webp", "bmp", // images
    "xz", "gz", "bz2", "zst", "zip", "tar", "7z", // archives
    "ttf", "otf", "woff", "woff2", "eot", // fonts
    "pdf", "ps", "dvi", "info", "texi", "texinfo", // other docs
    "haddock", "hi", "o", "a", "so", "dylib", // build artifacts
];

/// Case-folded extension, with a leading dot not counting as one
/// (`.bashrc` has no extension).
fn extension(name: &[u8]) -> Option<String> {
    let dot = name.rfind_byte(b'.')?;
    if dot == 0 {
        return None;
    }
    String::from_utf8(name[dot + 1..].to_ascii_lowercase()).ok()
}

pub fn is_skip_extension(name: &[u8]) -> bool {
    extension(name).is_some_and(|ext| SKIP_EXTENSIONS.contains(&ext.as_str()))
}

pub fn by_extension(name: &[u8]) -> Option<Language> {
    let ext = extension(name)?;
    Some(match ext.as_str() {
        "sh" | "bash" => Language::Sh,
        "zsh" => Language::Zsh,
        "py" | "pyw" => Language::Python,
        "pl" | "pm" => Language::Perl,
        "rb" => Language::Ruby,
        "lua" => Language::Lua,
        "tcl" => Language::Tcl,
        "js" | "mjs" => Language::Javascript,
        "json" => Language::Json,
        "conf" | "cfg" => Language::Conf,
        "desktop" => Language::Desktop,
        "properties" => Language::Properties,
        "ini" => Language::Ini,
        "mk" => Language::Makefile,
        "m4" => Language::M4,
        "xml" => Language::Xml,
        "awk" => Language::Awk,
        _ => return None,
    })
}

pub fn has_shebang(content: &[u8]) -> bool {
    content.starts_with(b"#!")
}

/// Infer the language from a `#!` line. The interpreter is the last
/// path component, which also strips any `/nix/store/<hash>-<name>`
/// prefix; an `env` indirection is followed one word further.
pub fn from_shebang(content: &[u8]) -> Option<Language> {
    if !has_shebang(content) || content.len() > MAX_CLASSIFY_SIZE {
        return None;
    }
    let line = &content[2..content.find_byte(b'\n').unwrap_or(content.len())];
    let line = std::str::from_utf8(line).ok()?;

    let mut words = line.split_ascii_whitespace();
    let mut interpreter = words.next()?.rsplit('/').next()?;
    if interpreter == "env" {
        interpreter = words.next()?.rsplit('/').next()?;
    }
    interpreter_language(interpreter)
}

fn interpreter_language(name: &str) -> Option<Language> {
    // Versioned interpreters (python3, perl5.36, lua5.4) alias to the
    // unversioned language.
    if name.starts_with("python") {
        return Some(Language::Python);
    }
    if name.starts_with("perl") {
        return Some(Language::Perl);
    }
    if name.starts_with("lua") {
        return Some(Language::Lua);
    }
    if name.starts_with("ruby") {
        return Some(Language::Ruby);
    }
    match name {
        "sh" | "bash" | "dash" | "ash" | "ksh" => Some(Language::Sh),
        "zsh" => Some(Language::Zsh),
        "tclsh" | "wish" => Some(Language::Tcl),
        "node" | "nodejs" => Some(Language::Javascript),
        "awk" | "gawk" | "mawk" | "nawk" => Some(Language::Awk),
        _ => None,
    }
}
