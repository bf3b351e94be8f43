//! The object store implemented using AWS S3.
//!

use crate::checksum::{decode_crc64, encode_crc64};
use crate::error::Error::ParseError;
use crate::error::Result;
use crate::io::{
    CompleteOutput, CompletedPart, Conditions, CopySource, CreateMultipartRequest, HeadRequest,
    MultipartTarget, ObjectBody, ObjectMeta, ObjectStore, PartOutput, RangeRequest, SseCustomer,
};
use async_trait::async_trait;
use aws_config::{load_defaults, BehaviorVersion};
use aws_sdk_s3::types::{ChecksumAlgorithm, ChecksumMode, CompletedMultipartUpload};
use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::ByteStream;
use aws_smithy_types::date_time::Format;
use aws_smithy_types::DateTime;
use std::sync::Arc;
use tracing::debug;

/// Create an S3 client by loading AWS environment variables.
pub async fn default_s3_client() -> Result<Client> {
    let config = load_defaults(BehaviorVersion::latest()).await;
    Ok(Client::new(&config))
}

/// Build an S3 object store.
#[derive(Debug, Default)]
pub struct S3Builder {
    client: Option<Arc<Client>>,
}

impl S3Builder {
    /// Set the client by loading AWS environment variables.
    pub async fn with_default_client(mut self) -> Result<Self> {
        self.client = Some(Arc::new(default_s3_client().await?));
        Ok(self)
    }

    /// Set the client.
    pub fn with_client(mut self, client: Arc<Client>) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the S3 store.
    pub fn build(self) -> Result<S3> {
        let client = self
            .client
            .ok_or_else(|| ParseError("a client is required in `S3Builder`".to_string()))?;

        Ok(S3::new(client))
    }
}

/// An S3 object store.
#[derive(Debug, Clone)]
pub struct S3 {
    client: Arc<Client>,
}

impl S3 {
    /// Create a new S3 store.
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Get the inner client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the copy source, including the version if there is one.
    fn copy_source(source: &CopySource) -> String {
        let location = &source.location;
        match &location.version_id {
            Some(version_id) => format!(
                "{}/{}?versionId={}",
                location.bucket, location.key, version_id
            ),
            None => format!("{}/{}", location.bucket, location.key),
        }
    }

    fn parse_date(date: &Option<String>) -> Result<Option<DateTime>> {
        date.as_deref()
            .map(|date| DateTime::from_str(date, Format::DateTime))
            .transpose()
            .map_err(|err| ParseError(err.to_string()))
    }

    fn format_date(date: Option<&DateTime>) -> Result<Option<String>> {
        date.map(|date| date.fmt(Format::DateTime))
            .transpose()
            .map_err(|err| ParseError(err.to_string()))
    }

    fn decode_crc64(crc64: Option<&str>) -> Result<Option<u64>> {
        crc64.map(decode_crc64).transpose()
    }

    fn split_sse(
        sse: &Option<SseCustomer>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        match sse {
            Some(sse) => (
                Some(sse.algorithm.clone()),
                Some(sse.key.clone()),
                Some(sse.key_md5.clone()),
            ),
            None => (None, None, None),
        }
    }

    fn split_conditions(
        conditions: &Conditions,
    ) -> Result<(
        Option<String>,
        Option<String>,
        Option<DateTime>,
        Option<DateTime>,
    )> {
        Ok((
            conditions.if_match.clone(),
            conditions.if_none_match.clone(),
            Self::parse_date(&conditions.if_modified_since)?,
            Self::parse_date(&conditions.if_unmodified_since)?,
        ))
    }
}

#[async_trait]
impl ObjectStore for S3 {
    async fn head_object(&self, request: &HeadRequest) -> Result<ObjectMeta> {
        let (algorithm, key, key_md5) = Self::split_sse(&request.sse);
        let (if_match, if_none_match, if_modified_since, if_unmodified_since) =
            Self::split_conditions(&request.conditions)?;

        let head = self
            .client
            .head_object()
            .bucket(&request.location.bucket)
            .key(&request.location.key)
            .set_version_id(request.location.version_id.clone())
            .set_if_match(if_match)
            .set_if_none_match(if_none_match)
            .set_if_modified_since(if_modified_since)
            .set_if_unmodified_since(if_unmodified_since)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await?;

        Ok(ObjectMeta {
            size: head
                .content_length()
                .map(u64::try_from)
                .transpose()?
                .unwrap_or_default(),
            e_tag: head.e_tag().map(|e_tag| e_tag.to_string()),
            last_modified: Self::format_date(head.last_modified())?,
            crc64: Self::decode_crc64(head.checksum_crc64_nvme())?,
            version_id: head.version_id().map(|version| version.to_string()),
            content_type: head.content_type().map(|content_type| content_type.to_string()),
            metadata: head.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn create_multipart_upload(&self, request: &CreateMultipartRequest) -> Result<String> {
        let (algorithm, key, key_md5) = Self::split_sse(&request.sse);
        let metadata = (!request.metadata.is_empty()).then(|| request.metadata.clone());

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .checksum_algorithm(ChecksumAlgorithm::Crc64Nvme)
            .set_content_type(request.content_type.clone())
            .set_metadata(metadata)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .send()
            .await?;

        upload
            .upload_id
            .ok_or_else(|| ParseError("missing upload id".to_string()))
    }

    async fn upload_part(
        &self,
        target: &MultipartTarget,
        part_number: u64,
        body: Vec<u8>,
    ) -> Result<PartOutput> {
        let (algorithm, key, key_md5) = Self::split_sse(&target.sse);

        let part = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .part_number(i32::try_from(part_number)?)
            .checksum_algorithm(ChecksumAlgorithm::Crc64Nvme)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .body(ByteStream::from(body))
            .send()
            .await?;

        Ok(PartOutput {
            e_tag: part.e_tag().map(|e_tag| e_tag.to_string()),
            crc64: Self::decode_crc64(part.checksum_crc64_nvme())?,
        })
    }

    async fn get_range(&self, request: &RangeRequest) -> Result<ObjectBody> {
        let (algorithm, key, key_md5) = Self::split_sse(&request.sse);
        let (if_match, if_none_match, if_modified_since, if_unmodified_since) =
            Self::split_conditions(&request.conditions)?;

        let result = self
            .client
            .get_object()
            .bucket(&request.location.bucket)
            .key(&request.location.key)
            .set_version_id(request.location.version_id.clone())
            .range(format!("bytes={}-{}", request.range_start, request.range_end))
            .set_if_match(if_match)
            .set_if_none_match(if_none_match)
            .set_if_modified_since(if_modified_since)
            .set_if_unmodified_since(if_unmodified_since)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .send()
            .await?;

        Ok(Box::new(result.body.into_async_read()))
    }

    async fn copy_part(
        &self,
        target: &MultipartTarget,
        part_number: u64,
        source: &CopySource,
    ) -> Result<PartOutput> {
        let (algorithm, key, key_md5) = Self::split_sse(&target.sse);
        let (source_algorithm, source_key, source_key_md5) = Self::split_sse(&source.sse);
        let (if_match, if_none_match, if_modified_since, if_unmodified_since) =
            Self::split_conditions(&source.conditions)?;

        let part = self
            .client
            .upload_part_copy()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .part_number(i32::try_from(part_number)?)
            .copy_source(Self::copy_source(source))
            .copy_source_range(format!("bytes={}-{}", source.range_start, source.range_end))
            .set_copy_source_if_match(if_match)
            .set_copy_source_if_none_match(if_none_match)
            .set_copy_source_if_modified_since(if_modified_since)
            .set_copy_source_if_unmodified_since(if_unmodified_since)
            .set_copy_source_sse_customer_algorithm(source_algorithm)
            .set_copy_source_sse_customer_key(source_key)
            .set_copy_source_sse_customer_key_md5(source_key_md5)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .send()
            .await?
            .copy_part_result
            .ok_or_else(|| ParseError("missing copy part result".to_string()))?;

        Ok(PartOutput {
            e_tag: part.e_tag().map(|e_tag| e_tag.to_string()),
            crc64: Self::decode_crc64(part.checksum_crc64_nvme())?,
        })
    }

    async fn complete_multipart_upload(
        &self,
        target: &MultipartTarget,
        parts: Vec<CompletedPart>,
    ) -> Result<CompleteOutput> {
        let parts = parts
            .into_iter()
            .map(|part| {
                Ok(aws_sdk_s3::types::CompletedPart::builder()
                    .set_e_tag(part.e_tag)
                    .set_checksum_crc64_nvme(part.crc64.map(encode_crc64))
                    .part_number(i32::try_from(part.part_number)?)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let (algorithm, key, key_md5) = Self::split_sse(&target.sse);
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(key)
            .set_sse_customer_key_md5(key_md5)
            .send()
            .await?;

        Ok(CompleteOutput {
            e_tag: output.e_tag().map(|e_tag| e_tag.to_string()),
            crc64: Self::decode_crc64(output.checksum_crc64_nvme())?,
            version_id: output.version_id().map(|version| version.to_string()),
        })
    }

    async fn abort_multipart_upload(&self, target: &MultipartTarget) -> Result<()> {
        debug!(
            bucket = %target.bucket,
            key = %target.key,
            upload_id = %target.upload_id,
            "aborting multipart upload"
        );

        self.client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .send()
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::crc64;
    use crate::io::ObjectLocation;
    use aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadOutput;
    use aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadOutput;
    use aws_sdk_s3::operation::head_object::HeadObjectOutput;
    use aws_sdk_s3::operation::upload_part::UploadPartOutput;
    use aws_sdk_s3::operation::upload_part_copy::UploadPartCopyOutput;
    use aws_sdk_s3::types::CopyPartResult;
    use aws_smithy_mocks_experimental::{mock, mock_client, RuleMode};

    const CRC64_123456789: &str = "rosUhgp5mIg=";

    fn target() -> MultipartTarget {
        MultipartTarget {
            bucket: "bucket".to_string(),
            key: "key".to_string(),
            upload_id: "upload".to_string(),
            sse: None,
        }
    }

    #[tokio::test]
    async fn head_object() -> anyhow::Result<()> {
        let rule = mock!(Client::head_object)
            .match_requests(|req| {
                req.bucket() == Some("bucket")
                    && req.key() == Some("key")
                    && req.version_id() == Some("v1")
                    && req.checksum_mode() == Some(&ChecksumMode::Enabled)
            })
            .then_output(|| {
                HeadObjectOutput::builder()
                    .content_length(9)
                    .e_tag("\"etag\"")
                    .last_modified(DateTime::from_secs(1700000000))
                    .checksum_crc64_nvme(CRC64_123456789)
                    .build()
            });
        let s3 = S3Builder::default()
            .with_client(Arc::new(mock_client!(
                aws_sdk_s3,
                RuleMode::Sequential,
                &[&rule]
            )))
            .build()?;

        let meta = s3
            .head_object(&HeadRequest {
                location: ObjectLocation::new("bucket", "key")
                    .with_version_id(Some("v1".to_string())),
                ..Default::default()
            })
            .await?;

        assert_eq!(meta.size, 9);
        assert_eq!(meta.e_tag.as_deref(), Some("\"etag\""));
        assert_eq!(meta.last_modified.as_deref(), Some("2023-11-14T22:13:20Z"));
        assert_eq!(meta.crc64, Some(crc64(b"123456789")));

        Ok(())
    }

    #[tokio::test]
    async fn multipart_lifecycle() -> anyhow::Result<()> {
        let create = mock!(Client::create_multipart_upload)
            .match_requests(|req| {
                req.checksum_algorithm() == Some(&ChecksumAlgorithm::Crc64Nvme)
            })
            .then_output(|| {
                CreateMultipartUploadOutput::builder()
                    .upload_id("upload")
                    .build()
            });
        let upload_part = mock!(Client::upload_part)
            .match_requests(|req| req.upload_id() == Some("upload") && req.part_number() == Some(1))
            .then_output(|| {
                UploadPartOutput::builder()
                    .e_tag("\"part1\"")
                    .checksum_crc64_nvme(CRC64_123456789)
                    .build()
            });
        let copy_part = mock!(Client::upload_part_copy)
            .match_requests(|req| {
                req.copy_source() == Some("source/object?versionId=v1")
                    && req.copy_source_range() == Some("bytes=9-18")
                    && req.part_number() == Some(2)
            })
            .then_output(|| {
                UploadPartCopyOutput::builder()
                    .copy_part_result(CopyPartResult::builder().e_tag("\"part2\"").build())
                    .build()
            });
        let complete = mock!(Client::complete_multipart_upload)
            .match_requests(|req| {
                req.multipart_upload().is_some_and(|upload| {
                    upload
                        .parts()
                        .iter()
                        .map(|part| part.part_number())
                        .collect::<Vec<_>>()
                        == vec![Some(1), Some(2)]
                })
            })
            .then_output(|| {
                CompleteMultipartUploadOutput::builder()
                    .e_tag("\"object-2\"")
                    .checksum_crc64_nvme(CRC64_123456789)
                    .build()
            });
        let s3 = S3Builder::default()
            .with_client(Arc::new(mock_client!(
                aws_sdk_s3,
                RuleMode::Sequential,
                &[&create, &upload_part, &copy_part, &complete]
            )))
            .build()?;

        let upload_id = s3
            .create_multipart_upload(&CreateMultipartRequest {
                bucket: "bucket".to_string(),
                key: "key".to_string(),
                ..Default::default()
            })
            .await?;
        assert_eq!(upload_id, "upload");

        let part = s3.upload_part(&target(), 1, b"123456789".to_vec()).await?;
        assert_eq!(part.e_tag.as_deref(), Some("\"part1\""));
        assert_eq!(part.crc64, Some(crc64(b"123456789")));

        let source = CopySource {
            location: ObjectLocation::new("source", "object")
                .with_version_id(Some("v1".to_string())),
            range_start: 9,
            range_end: 18,
            ..Default::default()
        };
        let copied = s3.copy_part(&target(), 2, &source).await?;
        assert_eq!(copied.e_tag.as_deref(), Some("\"part2\""));
        assert_eq!(copied.crc64, None);

        let output = s3
            .complete_multipart_upload(
                &target(),
                vec![
                    CompletedPart {
                        part_number: 1,
                        e_tag: part.e_tag,
                        crc64: part.crc64,
                    },
                    CompletedPart {
                        part_number: 2,
                        e_tag: copied.e_tag,
                        crc64: None,
                    },
                ],
            )
            .await?;
        assert_eq!(output.e_tag.as_deref(), Some("\"object-2\""));
        assert_eq!(output.crc64, Some(crc64(b"123456789")));

        Ok(())
    }
}
