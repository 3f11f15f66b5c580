use std::path::Path;
use url::Url;

/// Last path segment of a download URL, with query and fragment removed.
/// Falls back to a random token when the URL has no usable file name.
pub fn get_filename_from_url(url_str: &str) -> String {
    let segment = match Url::parse(url_str) {
        Ok(url) => url
            .path_segments()
            .and_then(|segments| segments.last())
            .map(str::to_string)
            .unwrap_or_default(),
        Err(_) => {
            // Not an absolute URL; strip query/fragment by hand.
            let end = url_str.find(['?', '#']).unwrap_or(url_str.len());
            let path = &url_str[..end];
            path.rsplit('/').next().unwrap_or_default().to_string()
        }
    };

    let sanitized = sanitize_filename(&segment);
    if sanitized.is_empty() {
        random_token()
    } else {
        sanitized
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_',
        "_",
    )
}

/// 128 random bits from the OS-seeded generator, as lowercase hex.
pub fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn random_suffix(len: usize) -> String {
    let mut token = random_token();
    token.truncate(len);
    token
}

/// Size of the file at `path`, 0 when it does not exist or cannot be read.
pub async fn file_size(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_filename_from_url_path() {
        assert_eq!(
            get_filename_from_url("https://example.com/files/data.bin"),
            "data.bin"
        );
        assert_eq!(
            get_filename_from_url("https://example.com/files/data.bin?version=2#top"),
            "data.bin"
        );
    }

    #[test]
    fn test_filename_from_url_without_segment() {
        let name = get_filename_from_url("https://example.com/");
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_filename_from_relative_input() {
        assert_eq!(get_filename_from_url("some/dir/report.pdf?x=1"), "report.pdf");
    }

    #[test]
    fn test_sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my file%20(1).txt"), "my_file_20_1_.txt");
    }

    #[test]
    fn test_random_suffix_length() {
        let suffix = random_suffix(6);
        assert_eq!(suffix.len(), 6);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[tokio::test]
    async fn test_file_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.bin");
        assert_eq!(file_size(&path).await, 0);
        tokio::fs::write(&path, b"hello").await.unwrap();
        assert_eq!(file_size(&path).await, 5);
    }
}
