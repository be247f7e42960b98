//! Filename sanitization for `Content-Disposition` attachments.
//!
//! Browsers save the attachment under the name we send, so anything that could
//! act as a path component or break the quoted header value is stripped.

/// Characters removed from attachment filenames.
const PATH_HOSTILE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Maximum filename length in characters, extension included.
pub const MAX_FILENAME_CHARS: usize = 120;

/// Name used when the title is empty or could not be resolved.
pub const FALLBACK_STEM: &str = "download";

/// Sanitize a title (without extension) for use as a filename stem.
///
/// Removes control characters and [`PATH_HOSTILE_CHARS`], trims surrounding
/// spaces and dots and falls back to [`FALLBACK_STEM`] when nothing is left.
/// Unicode text is preserved.
///
/// ```
/// use media_relay::utils::filename::sanitize_stem;
///
/// assert_eq!(sanitize_stem("a/b:c?"), "abc");
/// assert_eq!(sanitize_stem("  ..  "), "download");
/// ```
pub fn sanitize_stem(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() && !PATH_HOSTILE_CHARS.contains(c))
        .collect();

    let trimmed = cleaned.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build an attachment filename from an optional title and an extension.
///
/// The result never exceeds [`MAX_FILENAME_CHARS`] characters; the stem is
/// truncated on a character boundary so the extension always survives.
pub fn attachment_filename(title: Option<&str>, ext: &str) -> String {
    let stem = sanitize_stem(title.unwrap_or_default());
    let ext = sanitize_extension(ext);

    let budget = MAX_FILENAME_CHARS.saturating_sub(ext.chars().count() + 1);
    let stem: String = stem.chars().take(budget).collect();
    let stem = stem.trim_end_matches([' ', '.']);
    let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };

    format!("{stem}.{ext}")
}

/// Split a reported `title.ext` string into title and extension.
///
/// Returns `None` for the extension if the name has none or if it does not
/// look like a container extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

fn sanitize_extension(ext: &str) -> String {
    let ext: String = ext
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if ext.is_empty() {
        "bin".to_string()
    } else {
        ext.to_ascii_lowercase()
    }
}
