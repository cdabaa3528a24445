//! Local file URIs and sibling subtitle discovery

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::MediaError;

/// Probed in this order; the first existing sibling wins
const SUBTITLE_EXTENSIONS: [&str; 12] = [
    "sub", "SUB", "srt", "SRT", "smi", "SMI", "ssa", "SSA", "ass", "ASS", "asc", "ASC",
];

/// Subtitle file next to a local media file, as a `file://` URI.
///
/// Only `file://` URIs are probed; the media must have an extension.
pub(crate) fn find_sibling_subtitle(uri: &str) -> Option<String> {
    if !uri.starts_with("file://") {
        return None;
    }
    let path = Url::parse(uri).ok()?.to_file_path().ok()?;
    path.extension()?;

    SUBTITLE_EXTENSIONS
        .iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| Url::from_file_path(&candidate).ok())
        .map(String::from)
}

/// `file://` URI for `path`, resolving relative paths against the current directory
pub(crate) fn filename_to_uri(path: &Path) -> Result<String, MediaError> {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|_| MediaError::IoOrUri(format!("cannot convert {} to a URI", absolute.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("imb-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_sibling_srt_found() {
        let dir = scratch_dir("srt");
        fs::write(dir.join("movie.mkv"), b"").unwrap();
        fs::write(dir.join("movie.srt"), b"1\n").unwrap();
        let uri = Url::from_file_path(dir.join("movie.mkv")).unwrap().to_string();

        let found = find_sibling_subtitle(&uri).unwrap();
        assert_eq!(found, Url::from_file_path(dir.join("movie.srt")).unwrap().to_string());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_extension_order() {
        let dir = scratch_dir("order");
        fs::write(dir.join("movie.ass"), b"").unwrap();
        fs::write(dir.join("movie.sub"), b"").unwrap();
        let uri = Url::from_file_path(dir.join("movie.mkv")).unwrap().to_string();
        assert!(find_sibling_subtitle(&uri).unwrap().ends_with("movie.sub"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unrelated_extension_ignored() {
        let dir = scratch_dir("txt");
        fs::write(dir.join("movie.txt"), b"").unwrap();
        let uri = Url::from_file_path(dir.join("movie.mkv")).unwrap().to_string();
        assert_eq!(find_sibling_subtitle(&uri), None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_remote_uris_not_probed() {
        assert_eq!(find_sibling_subtitle("http://example.com/movie.mkv"), None);
        assert_eq!(find_sibling_subtitle("file:///no-extension"), None);
    }

    #[test]
    fn test_relative_filename_resolved() {
        let uri = filename_to_uri(Path::new("clip.mp4")).unwrap();
        assert!(uri.starts_with("file:///"));
        assert!(uri.ends_with("/clip.mp4"));
    }
}
