//! Skip-if-unchanged check for uploads.
//!
//! A stored object counts as unchanged when its size equals the staged
//! file's and, if it carries a single-part `ETag` (a bare MD5 hex digest),
//! that digest equals the staged file's MD5. Multipart `ETag`s
//! (`<digest>-<parts>`) are not content digests, so size alone decides.

use std::path::Path;

use tokio::io::AsyncReadExt as _;

use crate::ObjectMeta;

const DIGEST_CHUNK: usize = 256 * 1024;

/// Returns the stored `ETag` when it is a plain MD5 digest.
fn single_part_digest(etag: &str) -> Option<&str> {
    let digest = etag.trim_matches('"');
    (digest.len() == 32 && digest.bytes().all(|b| b.is_ascii_hexdigit())).then_some(digest)
}

/// Whether uploading `staged` over `stored` would change nothing.
pub async fn is_unchanged(staged: &Path, stored: &ObjectMeta) -> Result<bool, std::io::Error> {
    if tokio::fs::metadata(staged).await?.len() != stored.size {
        return Ok(false);
    }
    match stored.etag.as_deref().and_then(single_part_digest) {
        Some(digest) => Ok(file_md5(staged).await?.eq_ignore_ascii_case(digest)),
        None => Ok(true),
    }
}

/// MD5 hex digest of a local file.
pub async fn file_md5(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut chunk = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(format!("{:x}", context.finalize()));
        }
        context.consume(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(size: u64, etag: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            size,
            etag: etag.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn compares_size_then_single_part_digest() {
        let dir = std::env::temp_dir().join("taxi_object_store_unchanged");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("green-2016-01.csv");
        std::fs::write(&path, b"hello").unwrap();

        let digest = file_md5(&path).await.unwrap();
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");

        let quoted = format!("\"{digest}\"");
        assert!(is_unchanged(&path, &stored(5, Some(&quoted))).await.unwrap());
        assert!(
            !is_unchanged(&path, &stored(5, Some("\"00000000000000000000000000000000\"")))
                .await
                .unwrap()
        );
        assert!(is_unchanged(&path, &stored(5, Some("\"abc-2\""))).await.unwrap());
        assert!(is_unchanged(&path, &stored(5, None)).await.unwrap());
        assert!(!is_unchanged(&path, &stored(6, None)).await.unwrap());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_staged_file_is_an_error() {
        let path = std::env::temp_dir().join("taxi_object_store_unchanged_missing.csv");
        let _ = std::fs::remove_file(&path);
        assert!(is_unchanged(&path, &stored(0, None)).await.is_err());
    }
}
