//! Module that handles all object store IO.
//!

use crate::error::Error::ParseError;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use tokio::io::AsyncRead;

pub mod aws;
pub mod control;

/// The location of an object, parsed from a url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    File { file: String },
    S3 { bucket: String, key: String },
}

impl Provider {
    /// Format an S3 url.
    pub fn format_s3(bucket: &str, key: &str) -> String {
        format!("s3://{}/{}", bucket, key)
    }

    /// Parse from an S3 url, e.g.`s3://bucket/key`.
    pub fn parse_s3_url(s: &str) -> Result<Self> {
        let Some(s) = s.strip_prefix("s3://") else {
            return Err(ParseError(format!("{} is not an S3 url", s)));
        };

        let split = s.split_once("/");
        let Some((bucket, key)) = split else {
            return Err(ParseError(format!("failed to parse {}", s)));
        };

        if bucket.is_empty() {
            return Err(ParseError(format!("{} is missing a bucket", s)));
        }
        if key.is_empty() {
            return Err(ParseError(format!("{} is missing a key", s)));
        }

        Ok(Self::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Parse from a string a file name which can optionally be prefixed with `file://`
    pub fn parse_file_url(s: &str) -> Self {
        Self::File {
            file: s.strip_prefix("file://").unwrap_or(s).to_string(),
        }
    }

    /// Get the bucket and key if this is an S3 provider.
    pub fn into_s3(self) -> Result<(String, String)> {
        match self {
            Provider::S3 { bucket, key } => Ok((bucket, key)),
            Provider::File { file } => Err(ParseError(format!("{file} is not an S3 url"))),
        }
    }

    /// Get the file name if this is a file provider.
    pub fn into_file(self) -> Result<String> {
        match self {
            Provider::File { file } => Ok(file),
            Provider::S3 { bucket, key } => Err(ParseError(format!(
                "{} is not a file",
                Self::format_s3(&bucket, &key)
            ))),
        }
    }
}

/// The bucket, key and optional version of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl ObjectLocation {
    /// Create a location without a version.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
        }
    }

    /// Set the version.
    pub fn with_version_id(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }
}

impl Display for ObjectLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&Provider::format_s3(&self.bucket, &self.key))?;
        if let Some(version_id) = &self.version_id {
            write!(f, "?versionId={version_id}")?;
        }
        Ok(())
    }
}

/// Conditional request headers. Dates use the RFC 3339 format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_unmodified_since: Option<String>,
}

/// Server-side encryption with a customer provided key.
#[derive(Clone, PartialEq, Eq)]
pub struct SseCustomer {
    pub algorithm: String,
    pub key: String,
    pub key_md5: String,
}

impl SseCustomer {
    /// The parts of the encryption settings that are safe to store.
    pub fn identity(&self) -> SseIdentity {
        SseIdentity {
            algorithm: self.algorithm.clone(),
            key_md5: self.key_md5.clone(),
        }
    }
}

impl std::fmt::Debug for SseCustomer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseCustomer")
            .field("algorithm", &self.algorithm)
            .field("key_md5", &self.key_md5)
            .finish_non_exhaustive()
    }
}

/// Encryption settings recorded in a checkpoint, without the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SseIdentity {
    pub algorithm: String,
    pub key_md5: String,
}

/// Object metadata returned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub e_tag: Option<String>,
    pub last_modified: Option<String>,
    pub crc64: Option<u64>,
    pub version_id: Option<String>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Fetch the metadata of an object.
#[derive(Debug, Clone, Default)]
pub struct HeadRequest {
    pub location: ObjectLocation,
    pub conditions: Conditions,
    pub sse: Option<SseCustomer>,
}

/// Start a multipart session.
#[derive(Debug, Clone, Default)]
pub struct CreateMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub sse: Option<SseCustomer>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// An open multipart session that parts are written to.
#[derive(Debug, Clone)]
pub struct MultipartTarget {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub sse: Option<SseCustomer>,
}

/// Fetch an inclusive byte range of an object.
#[derive(Debug, Clone, Default)]
pub struct RangeRequest {
    pub location: ObjectLocation,
    pub conditions: Conditions,
    pub sse: Option<SseCustomer>,
    pub range_start: u64,
    pub range_end: u64,
}

/// The source range of a server-side part copy.
#[derive(Debug, Clone, Default)]
pub struct CopySource {
    pub location: ObjectLocation,
    pub conditions: Conditions,
    pub sse: Option<SseCustomer>,
    pub range_start: u64,
    pub range_end: u64,
}

/// The result of writing one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartOutput {
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
}

/// A part passed when completing a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u64,
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
}

/// The result of completing a multipart session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteOutput {
    pub e_tag: Option<String>,
    pub crc64: Option<u64>,
    pub version_id: Option<String>,
}

/// The body of a ranged get.
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// The operations a transfer needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get the size, identity and whole-object checksum of an object.
    async fn head_object(&self, request: &HeadRequest) -> Result<ObjectMeta>;

    /// Start a multipart session, returning its upload id.
    async fn create_multipart_upload(&self, request: &CreateMultipartRequest) -> Result<String>;

    /// Upload the contents of one part.
    async fn upload_part(
        &self,
        target: &MultipartTarget,
        part_number: u64,
        body: Vec<u8>,
    ) -> Result<PartOutput>;

    /// Read a byte range of an object.
    async fn get_range(&self, request: &RangeRequest) -> Result<ObjectBody>;

    /// Copy a byte range of another object into one part.
    async fn copy_part(
        &self,
        target: &MultipartTarget,
        part_number: u64,
        source: &CopySource,
    ) -> Result<PartOutput>;

    /// Assemble the parts, which must be ordered by part number, into an object.
    async fn complete_multipart_upload(
        &self,
        target: &MultipartTarget,
        parts: Vec<CompletedPart>,
    ) -> Result<CompleteOutput>;

    /// Discard a multipart session and its parts.
    async fn abort_multipart_upload(&self, target: &MultipartTarget) -> Result<()>;
}
