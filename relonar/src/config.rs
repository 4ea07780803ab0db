//! CLI surface and construction of the immutable rewrite settings.

use std::path::PathBuf;

use clap::Parser;
use relonar_rewrite::{Highlighter, MappingTable, RewriteSettings};
use tracing::warn;

use crate::error::PatchNarError;

/// Rewrite a NAR stream so every store path it references points into a
/// relocated installation prefix. Reads one NAR on stdin, writes the
/// patched NAR to stdout; diagnostics go to stderr.
#[derive(Parser, Debug, Default)]
#[command(name = "relonar", version)]
pub struct Cli {
    /// Installation prefix prepended to store paths (e.g. /data/.../usr)
    #[arg(long, value_name = "PATH")]
    pub prefix: Option<String>,

    /// Replacement glibc store path
    #[arg(long, value_name = "STORE_PATH")]
    pub glibc: Option<String>,

    /// Original glibc store path to replace
    #[arg(long = "old-glibc", value_name = "STORE_PATH")]
    pub old_glibc: Option<String>,

    /// Mappings file, one `OLD_PATH NEW_PATH` pair per line
    #[arg(long, value_name = "FILE")]
    pub mappings: Option<PathBuf>,

    /// Single inline mapping pair, "OLD_PATH NEW_PATH"
    #[arg(long = "self-mapping", value_name = "MAP")]
    pub self_mapping: Option<String>,

    /// Path pattern to prefix inside script string literals, e.g.
    /// /nix/var/ (repeatable)
    #[arg(long = "add-prefix-to", value_name = "PATH")]
    pub add_prefix_to: Vec<String>,

    /// Directory with extra syntax definitions for the tokenizer
    #[arg(long = "source-highlight-data-dir", value_name = "DIR")]
    pub source_highlight_data_dir: Option<PathBuf>,

    /// Enable debug diagnostics
    #[arg(long)]
    pub debug: bool,
}

/// Build the rewrite settings, or fail before a byte of stdin is read.
pub fn build_settings(cli: &Cli) -> Result<RewriteSettings, PatchNarError> {
    let prefix = cli
        .prefix
        .clone()
        .or_else(|| option_env!("RELONAR_DEFAULT_PREFIX").map(str::to_owned))
        .filter(|p| !p.is_empty())
        .ok_or_else(|| PatchNarError::config("--prefix is required"))?;

    let old_glibc = cli
        .old_glibc
        .clone()
        .or_else(|| option_env!("RELONAR_DEFAULT_OLD_GLIBC").map(str::to_owned))
        .unwrap_or_default();
    let new_glibc = cli.glibc.clone().unwrap_or_default();
    if old_glibc.is_empty() != new_glibc.is_empty() {
        return Err(PatchNarError::config(
            "--glibc and --old-glibc must be given together",
        ));
    }

    let mut mappings = match &cli.mappings {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => MappingTable::parse(&text),
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open mappings file");
                MappingTable::new()
            }
        },
        None => MappingTable::new(),
    };

    if let Some(pair) = &cli.self_mapping {
        let Some((old, new)) = pair.split_once(' ') else {
            return Err(PatchNarError::config(
                "--self-mapping requires \"OLD_PATH NEW_PATH\"",
            ));
        };
        mappings.insert(old.as_bytes(), new.as_bytes());
    }

    Ok(RewriteSettings {
        prefix: prefix.into_bytes(),
        old_glibc: old_glibc.into_bytes(),
        new_glibc: new_glibc.into_bytes(),
        extra_prefix_patterns: cli
            .add_prefix_to
            .iter()
            .map(|p| p.clone().into_bytes())
            .collect(),
        mappings,
    })
}

/// Build the tokenizer. A broken extra-syntax directory degrades to the
/// bundled definitions rather than failing the run.
pub fn build_highlighter(cli: &Cli) -> Highlighter {
    let dir = cli
        .source_highlight_data_dir
        .clone()
        .or_else(|| option_env!("RELONAR_SYNTAX_DIR").map(PathBuf::from));

    match dir {
        Some(dir) => match Highlighter::with_extra_syntaxes(&dir) {
            Ok(highlighter) => highlighter,
            Err(err) => {
                warn!(%err, "falling back to bundled syntax definitions");
                Highlighter::new()
            }
        },
        None => Highlighter::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn prefix_is_required() {
        let cli = Cli::default();
        assert!(matches!(
            build_settings(&cli),
            Err(PatchNarError::Config(_))
        ));
    }

    #[test]
    fn glibc_flags_must_pair() {
        let cli = Cli {
            prefix: Some("/p".into()),
            glibc: Some("/nix/store/xyz-glibc".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_settings(&cli),
            Err(PatchNarError::Config(_))
        ));
    }

    #[test]
    fn self_mapping_requires_a_space() {
        let cli = Cli {
            prefix: Some("/p".into()),
            self_mapping: Some("missing-the-space".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_settings(&cli),
            Err(PatchNarError::Config(_))
        ));
    }

    #[test]
    fn mappings_file_and_self_mapping_combine() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "/nix/store/aaa-foo /nix/store/bbb-foo").unwrap();

        let cli = Cli {
            prefix: Some("/p".into()),
            mappings: Some(file.path().to_path_buf()),
            self_mapping: Some("/nix/store/ccc-bar /nix/store/ddd-bar".into()),
            ..Default::default()
        };
        let settings = build_settings(&cli).unwrap();
        assert_eq!(settings.mappings.len(), 2);
    }

    #[test]
    fn missing_mappings_file_degrades_to_empty() {
        let cli = Cli {
            prefix: Some("/p".into()),
            mappings: Some(PathBuf::from("/does/not/exist")),
            ..Default::default()
        };
        let settings = build_settings(&cli).unwrap();
        assert!(settings.mappings.is_empty());
    }
}
