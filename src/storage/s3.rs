//! S3 and S3-compatible storage client

use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{Delete, ObjectCannedAcl, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};

use super::{
    BackendConfig, CopyOptions, DeleteError, DeleteOutcome, ListPage, ListedObject, ObjectAcl,
    ObjectStorageClient,
};
use crate::error::{BucketSyncError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(180);

/// Region used to sign requests to DigitalOcean Spaces
const SPACE_SIGNING_REGION: &str = "us-east-1";

/// Storage client backed by `aws-sdk-s3`
#[derive(Clone)]
pub struct S3StorageClient {
    client: S3Client,
}

impl std::fmt::Debug for S3StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3StorageClient").finish_non_exhaustive()
    }
}

impl S3StorageClient {
    /// Build a client for the given backend
    ///
    /// The S3 backend uses the standard AWS credential chain (env vars,
    /// ~/.aws, IAM roles). The Space backend uses the static keys from its
    /// config file.
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        config.validate()?;

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_timeout(OPERATION_TIMEOUT)
            .build();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);

        match config {
            BackendConfig::S3 { region, endpoint } => {
                if let Some(region) = region {
                    loader = loader.region(Region::new(region.clone()));
                }
                if let Some(endpoint) = endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
            }
            BackendConfig::Space {
                endpoint,
                access_key_id,
                secret_access_key,
                ..
            } => {
                let endpoint = if endpoint.starts_with("http") {
                    endpoint.clone()
                } else {
                    format!("https://{}", endpoint)
                };
                loader = loader
                    .region(Region::new(SPACE_SIGNING_REGION))
                    .endpoint_url(endpoint)
                    .credentials_provider(Credentials::new(
                        access_key_id.clone(),
                        secret_access_key.clone(),
                        None,
                        None,
                        "bucketsync-space-config",
                    ));
            }
        }

        let sdk_config = loader.load().await;
        Ok(Self {
            client: S3Client::new(&sdk_config),
        })
    }

    /// Wrap an already configured SDK client
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStorageClient for S3StorageClient {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(max_keys.min(i32::MAX as usize) as i32)
            .set_continuation_token(cursor.map(String::from))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("list s3://{}/{}", bucket, prefix)))?;

        let items = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?;
                Some(ListedObject {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    etag: obj.e_tag().map(String::from),
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        Ok(ListPage {
            items,
            next_cursor: response.next_continuation_token().map(String::from),
            truncated: response.is_truncated().unwrap_or(false),
        })
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dest_bucket: &str,
        dest_key: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        let acl = options.acl.map(|acl| match acl {
            ObjectAcl::Private => ObjectCannedAcl::Private,
            ObjectAcl::PublicRead => ObjectCannedAcl::PublicRead,
        });

        self.client
            .copy_object()
            .copy_source(copy_source(src_bucket, src_key))
            .bucket(dest_bucket)
            .key(dest_key)
            .set_acl(acl)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("copy {} to {}", src_key, dest_key)))?;

        tracing::debug!(
            "Copied s3://{}/{} to s3://{}/{}",
            src_bucket,
            src_key,
            dest_bucket,
            dest_key
        );
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<DeleteOutcome> {
        if keys.is_empty() {
            return Ok(DeleteOutcome::default());
        }

        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BucketSyncError::InvalidRequest(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| BucketSyncError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| {
                map_sdk_error(e, &format!("delete {} objects in s3://{}", keys.len(), bucket))
            })?;

        let deleted = response
            .deleted()
            .iter()
            .filter_map(|d| d.key().map(String::from))
            .collect();
        let errors = response
            .errors()
            .iter()
            .filter_map(|e| {
                let key = e.key()?.to_string();
                let message = match (e.code(), e.message()) {
                    (Some(code), Some(message)) => format!("{}: {}", code, message),
                    (Some(code), None) => code.to_string(),
                    (None, Some(message)) => message.to_string(),
                    (None, None) => "unknown delete error".to_string(),
                };
                Some(DeleteError { key, message })
            })
            .collect();

        Ok(DeleteOutcome { deleted, errors })
    }
}

/// `bucket/key` with each key segment URL-encoded
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single()
}

/// Translate an SDK failure into the crate's error taxonomy
fn map_sdk_error<E>(err: SdkError<E>, context: &str) -> BucketSyncError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => BucketSyncError::Timeout(context.to_string()),
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() {
                BucketSyncError::Timeout(context.to_string())
            } else {
                BucketSyncError::Unreachable(format!("{}: {:?}", context, err))
            }
        }
        SdkError::ResponseError(_) => {
            BucketSyncError::Unreachable(format!("{}: malformed response", context))
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code();
            let message = service.err().message().unwrap_or("no message");
            BucketSyncError::from_status(status, code, format!("{}: {}", context, message))
        }
        _ => BucketSyncError::CloudStorage(format!("{}: {:?}", context, err)),
    }
}
