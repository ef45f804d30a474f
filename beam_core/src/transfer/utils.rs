use crate::transfer::constants::{MAX_FILENAME_LENGTH, STAGING_DIR};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};

const FALLBACK_NAME: &str = "unknown_file";

/// Name to put on the wire for a local file. `:` would forge a delimiter, so it becomes `_`.
pub fn outgoing_file_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    name.replace(':', "_")
}

/// Open a file with secure permissions (0o600 on Unix) for writing
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Where a partial file for `request_id` is written before it is promoted.
pub fn staging_path(download_dir: &Path, request_id: &str) -> PathBuf {
    download_dir
        .join(STAGING_DIR)
        .join(format!("{}.part", request_id))
}

fn candidate_name(file_name: &str, n: u32) -> String {
    if n == 0 {
        return file_name.to_string();
    }
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    }
}

/// Claim a free name in `dir`: `name`, then `name_1`, `name_2`, … before the extension.
///
/// The name is reserved by creating an empty placeholder, so two receivers
/// finishing at once never pick the same path. Callers rename over it.
pub async fn reserve_unique_destination(dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let mut n = 0u32;
    loop {
        let candidate = dir.join(candidate_name(file_name, n));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

fn truncate_at_boundary(s: &mut String, max: usize) {
    let mut cutoff = max;
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

/// Sanitize file name to prevent path traversal attacks and ensure safety
pub fn sanitize_file_name(file_name: &str) -> String {
    // Only the last path component survives, whichever separator was used
    let file_name = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(FALLBACK_NAME);

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // Never write into the staging folder's namespace
    if clean_name == STAGING_DIR {
        return FALLBACK_NAME.to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        match clean_name.rfind('.') {
            Some(idx) if clean_name.len() - idx < 20 => {
                let ext = clean_name[idx..].to_string();
                let mut base = clean_name[..idx].to_string();
                truncate_at_boundary(&mut base, MAX_FILENAME_LENGTH - ext.len());
                base.push_str(&ext);
                clean_name = base;
            }
            _ => truncate_at_boundary(&mut clean_name, MAX_FILENAME_LENGTH),
        }
    }

    clean_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\Windows\\System32\\cmd.exe"), "cmd.exe");
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_dangerous() {
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name(""), "unknown_file");
        assert_eq!(sanitize_file_name("/"), "unknown_file");
        assert_eq!(sanitize_file_name("con"), "unknown_file");
        assert_eq!(sanitize_file_name(STAGING_DIR), "unknown_file");
        assert_eq!(sanitize_file_name("bell\u{7}.txt"), "bell.txt");
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
    }

    #[test]
    fn test_sanitize_file_name_unicode_truncate() {
        // 🦀 is 4 bytes, a naive cut would split it
        let mut long_unicode = "🦀".repeat(100);
        long_unicode.push_str(".txt");

        let sanitized = sanitize_file_name(&long_unicode);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));
        assert_eq!(sanitized.trim_end_matches(".txt").chars().last(), Some('🦀'));

        let sanitized_no_ext = sanitize_file_name(&"a".repeat(300));
        assert_eq!(sanitized_no_ext.len(), MAX_FILENAME_LENGTH);
    }

    #[test]
    fn test_outgoing_name_escapes_delimiter() {
        assert_eq!(outgoing_file_name(Path::new("/tmp/report::v2.pdf")), "report__v2.pdf");
        assert_eq!(outgoing_file_name(Path::new("plain.txt")), "plain.txt");
    }

    #[test]
    fn test_candidate_names() {
        assert_eq!(candidate_name("a.txt", 0), "a.txt");
        assert_eq!(candidate_name("a.txt", 2), "a_2.txt");
        assert_eq!(candidate_name("archive.tar.gz", 1), "archive.tar_1.gz");
        assert_eq!(candidate_name("README", 1), "README_1");
        assert_eq!(candidate_name(".bashrc", 1), ".bashrc_1");
    }

    #[tokio::test]
    async fn test_reserve_unique_destination() {
        let dir = tempfile::tempdir().unwrap();

        let first = reserve_unique_destination(dir.path(), "a.txt").await.unwrap();
        let second = reserve_unique_destination(dir.path(), "a.txt").await.unwrap();
        let third = reserve_unique_destination(dir.path(), "a.txt").await.unwrap();

        assert_eq!(first, dir.path().join("a.txt"));
        assert_eq!(second, dir.path().join("a_1.txt"));
        assert_eq!(third, dir.path().join("a_2.txt"));
    }

    #[tokio::test]
    async fn test_open_secure_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("secure.part");

        let _file = open_secure_file(&file_path)
            .await
            .expect("Failed to create secure file");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(&file_path)
                .await
                .expect("Failed to get metadata");
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }
}
