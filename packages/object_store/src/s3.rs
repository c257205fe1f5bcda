//! S3-backed object store.
//!
//! Credentials and endpoint come from the standard AWS environment
//! (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_ENDPOINT_URL`,
//! profiles); only the region is passed explicitly.

use std::ops::Range;
use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, Tag, Tagging};

use crate::sync::is_unchanged;
use crate::{ObjectMeta, ObjectReader, ObjectStore, ObjectStoreError, PutOptions, PutOutcome};

/// Maximum number of ranged-read attempts (initial + retries).
const MAX_GET_ATTEMPTS: u32 = 3;

/// Base delay between read retries (doubles each attempt).
const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Objects in an S3 bucket, optionally under a key prefix.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Loads AWS configuration for `region` and creates a client.
    pub async fn connect(bucket: &str, prefix: &str, region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self::from_client(aws_sdk_s3::Client::new(&config), bucket, prefix)
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn from_client(client: aws_sdk_s3::Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    fn strip_key<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full)
        }
    }

    /// Single ranged `GetObject` attempt.
    async fn get_once(&self, key: &str, range: &Range<u64>) -> Result<ObjectReader, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    ObjectStoreError::NotFound {
                        uri: self.uri(),
                        key: key.to_string(),
                    }
                } else {
                    ObjectStoreError::Get {
                        uri: self.uri(),
                        key: key.to_string(),
                        source: Box::new(err),
                    }
                }
            })?;

        Ok(Box::pin(output.body.into_async_read()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn uri(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }

    async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
    ) -> Result<ObjectReader, ObjectStoreError> {
        if range.start >= range.end {
            return Ok(Box::pin(tokio::io::empty()));
        }

        let mut last_err: Option<ObjectStoreError> = None;

        for attempt in 1..=MAX_GET_ATTEMPTS {
            match self.get_once(key, &range).await {
                Ok(reader) => return Ok(reader),
                Err(e @ ObjectStoreError::Get { .. }) if attempt < MAX_GET_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "  read attempt {attempt}/{MAX_GET_ATTEMPTS} for {key} failed, \
                         retrying in {delay:.1?}..."
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ObjectStoreError::Get {
            uri: self.uri(),
            key: key.to_string(),
            source: "all read attempts exhausted".into(),
        }))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0);
                #[allow(clippy::cast_sign_loss)] // S3 content-length is non-negative
                let size = size as u64;
                let etag = output.e_tag().map(str::to_string);
                Ok(Some(ObjectMeta { size, etag }))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(ObjectStoreError::Head {
                    uri: self.uri(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        options: &PutOptions,
    ) -> Result<PutOutcome, ObjectStoreError> {
        if !options.force
            && let Some(remote) = self.head(key).await?
            && is_unchanged(path, &remote).await?
        {
            log::info!(
                "  {} -> {}/{key}: skipped (unchanged)",
                path.display(),
                self.uri()
            );
            return Ok(PutOutcome::Skipped);
        }

        let size = tokio::fs::metadata(path).await?.len();
        #[allow(clippy::cast_precision_loss)] // display-only MB value
        let mb = size as f64 / 1_048_576.0;
        log::info!("Pushing {} -> {}/{key} ({mb:.1} MB)", path.display(), self.uri());

        let put_err = |e: Box<dyn std::error::Error + Send + Sync>| ObjectStoreError::Put {
            uri: self.uri(),
            key: key.to_string(),
            source: e,
        };

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| put_err(Box::new(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(body)
            .content_type("text/csv")
            .set_acl(
                options
                    .cross_account
                    .then_some(ObjectCannedAcl::BucketOwnerFullControl),
            )
            .send()
            .await
            .map_err(|e| put_err(Box::new(e)))?;

        log::info!("  uploaded {key}");
        Ok(PutOutcome::Transferred)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        log::info!("Listing {}/{prefix}*", self.uri());

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        let full_prefix = self.full_key(prefix);

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|e| ObjectStoreError::List {
                uri: self.uri(),
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(self.strip_key(key).to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        keys.sort();
        log::info!("  found {} objects", keys.len());
        Ok(keys)
    }

    async fn tag(&self, key: &str, tags: &[(String, String)]) -> Result<(), ObjectStoreError> {
        let tag_err = |e: Box<dyn std::error::Error + Send + Sync>| ObjectStoreError::Tag {
            uri: self.uri(),
            key: key.to_string(),
            source: e,
        };

        let tag_set = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tag_err(Box::new(e)))?;

        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| tag_err(Box::new(e)))?;

        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| tag_err(Box::new(e)))?;

        log::debug!("  tagged {key} with {} tags", tags.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: &str) -> S3ObjectStore {
        let config = aws_sdk_s3::Config::builder()
            .region(Region::new("us-east-1"))
            .behavior_version(BehaviorVersion::latest())
            .build();
        S3ObjectStore::from_client(aws_sdk_s3::Client::from_conf(config), "trips", prefix)
    }

    #[test]
    fn prefixes_keys() {
        let s = store("/normalized/");
        assert_eq!(s.uri(), "s3://trips/normalized");
        assert_eq!(s.full_key("green-2016-01.csv"), "normalized/green-2016-01.csv");
        assert_eq!(s.strip_key("normalized/green-2016-01.csv"), "green-2016-01.csv");
    }

    #[test]
    fn bare_bucket_keys_pass_through() {
        let s = store("");
        assert_eq!(s.uri(), "s3://trips");
        assert_eq!(s.full_key("yellow-2015-12.csv"), "yellow-2015-12.csv");
        assert_eq!(s.strip_key("yellow-2015-12.csv"), "yellow-2015-12.csv");
    }
}
