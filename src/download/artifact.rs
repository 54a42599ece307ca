//! On-disk artifact conventions for chapter downloads.
//!
//! A chapter downloads into a working directory (or, after compression, a
//! `.cbz` archive) carrying the [`TMP_SUFFIX`]. Finalization strips the
//! suffix with a single atomic rename. Page files inside the directory are
//! named by zero-padded 3-digit index plus an extension sniffed from the
//! first bytes of the body.

use std::path::{Path, PathBuf};

use crate::model::{Chapter, Manga};

/// Suffix marking an in-progress artifact (directory or archive).
pub const TMP_SUFFIX: &str = ".tmp";

/// Extension of a compressed chapter archive (before the tmp suffix).
pub const ARCHIVE_EXTENSION: &str = "cbz";

/// Extension written for text pages.
pub const TEXT_EXTENSION: &str = "txt";

/// Returns `true` if the path carries the in-progress suffix.
#[must_use]
pub fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TMP_SUFFIX))
}

/// Returns the final path for a temporary artifact by stripping the suffix.
///
/// Returns `None` if the path does not carry the suffix.
#[must_use]
pub fn final_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stripped = name.strip_suffix(TMP_SUFFIX)?;
    if stripped.is_empty() {
        return None;
    }
    Some(path.with_file_name(stripped))
}

/// Returns the working directory for a chapter download.
///
/// Layout: `<root>/<source name>/<manga title>/<chapter name>.tmp`, with
/// every component sanitized for the filesystem.
#[must_use]
pub fn chapter_tmp_dir(root: &Path, source_name: &str, manga: &Manga, chapter: &Chapter) -> PathBuf {
    root.join(sanitize_component(source_name))
        .join(sanitize_component(&manga.title))
        .join(format!("{}{TMP_SUFFIX}", sanitize_component(&chapter.name)))
}

/// Returns the finalized archive path for a chapter's final directory.
///
/// The extension is appended to the whole directory name rather than
/// replacing anything after a dot, so dotted chapter names keep their stem
/// (`Vol.1 Ch.1` -> `Vol.1 Ch.1.cbz`).
#[must_use]
pub fn archive_final_path(final_dir: &Path) -> Option<PathBuf> {
    let name = final_dir.file_name()?.to_str()?;
    Some(final_dir.with_file_name(format!("{name}.{ARCHIVE_EXTENSION}")))
}

/// Returns the archive path for a compressed chapter, next to its directory.
///
/// `dir` must be the chapter's temporary working directory; the archive is
/// `<final dir name>.cbz.tmp` in the same parent.
#[must_use]
pub fn archive_tmp_path(dir: &Path) -> Option<PathBuf> {
    let archive = archive_final_path(&final_path(dir)?)?;
    let name = archive.file_name()?.to_str()?;
    Some(archive.with_file_name(format!("{name}{TMP_SUFFIX}")))
}

/// Returns the extension-less filename for a page index (`7` -> `"007"`).
#[must_use]
pub fn page_stem(index: u32) -> String {
    format!("{index:03}")
}

/// Parses a page index from a filename, ignoring any extension.
///
/// Accepts exactly the names produced by [`page_stem`]; returns `None` for
/// anything else (including temporary files).
#[must_use]
pub fn parse_page_index(file_name: &str) -> Option<u32> {
    if file_name.ends_with(TMP_SUFFIX) {
        return None;
    }
    let stem = file_name.split('.').next()?;
    if stem.len() < 3 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = stem.parse().ok()?;
    // Only canonical names count; "0001" is not a page even though it parses.
    (page_stem(index) == stem).then_some(index)
}

/// Sniffs an image extension from the first bytes of a body.
///
/// Recognizes JPEG, PNG, GIF, and WebP signatures; returns `None` for
/// anything else, in which case the page file keeps no extension.
#[must_use]
pub fn sniff_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some("jpg");
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("png");
    }
    if bytes.len() >= 6 && &bytes[0..3] == b"GIF" {
        return Some("gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    None
}

/// Replaces filesystem-hostile characters in a path component.
///
/// Collapses runs of replaced characters into a single underscore and trims
/// leading/trailing underscores.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_').trim();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
