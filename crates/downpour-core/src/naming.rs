//! File naming: validation, collision renaming, and the content-addressed
//! item UID.

use md5::{Digest, Md5};
use std::path::Path;

/// Characters that cannot appear in a file name on at least one supported
/// platform.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Strip forbidden and control characters from a proposed file name and trim
/// surrounding whitespace and trailing dots. Falls back to `download` when
/// nothing survives.
pub fn validate_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();

    // keep names within common filesystem limits
    let mut cleaned = if cleaned.chars().count() > 255 {
        cleaned.chars().take(255).collect()
    } else {
        cleaned
    };

    if cleaned.is_empty() {
        cleaned = "download".to_string();
    }
    cleaned
}

/// The item UID: hex MD5 of `folder || name`. Renaming or relocating an item
/// recomputes it, which also relocates its temp folder.
pub fn uid(folder: &Path, name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(folder.to_string_lossy().as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `video.mp4` into (`video`, `.mp4`); the extension includes the dot.
pub fn split_extension(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(i) if i > 0 => (name[..i].to_string(), name[i..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

/// Rename a file to avoid clashing with existing names: `<name>_<n><ext>`
/// with the smallest n ≥ 2 not present in `forbidden`.
pub fn auto_rename(file_name: &str, forbidden: &[String]) -> String {
    let (stem, ext) = split_extension(file_name);
    for n in 2..1_000_000u32 {
        let candidate = format!("{stem}_{n}{ext}");
        if !forbidden.iter().any(|f| f == &candidate) {
            return candidate;
        }
    }
    file_name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn validate_strips_forbidden_chars() {
        assert_eq!(validate_file_name("a<b>c:d.mp4"), "abcd.mp4");
        assert_eq!(validate_file_name("  spaced name.mkv  "), "spaced name.mkv");
        assert_eq!(validate_file_name("///"), "download");
    }

    #[test]
    fn auto_rename_picks_smallest_free_slot() {
        let existing = vec!["video.mp4".to_string(), "video_2.mp4".to_string()];
        assert_eq!(auto_rename("video.mp4", &existing), "video_3.mp4");

        let none: Vec<String> = vec![];
        assert_eq!(auto_rename("video.mp4", &none), "video_2.mp4");
    }

    #[test]
    fn uid_changes_with_name_and_folder() {
        let a = uid(&PathBuf::from("/tmp"), "video.mp4");
        let b = uid(&PathBuf::from("/tmp"), "video_3.mp4");
        let c = uid(&PathBuf::from("/home"), "video.mp4");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert_eq!(a, uid(&PathBuf::from("/tmp"), "video.mp4"));
    }

    #[test]
    fn extension_split() {
        assert_eq!(split_extension("video.mp4"), ("video".into(), ".mp4".into()));
        assert_eq!(split_extension("noext"), ("noext".into(), String::new()));
        assert_eq!(split_extension(".hidden"), (".hidden".into(), String::new()));
    }
}
