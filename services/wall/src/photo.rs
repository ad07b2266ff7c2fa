use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Smallest accepted upload in bytes
pub const MIN_PHOTO_BYTES: u64 = 1000;

/// Largest accepted upload in bytes (10MB)
pub const MAX_PHOTO_BYTES: u64 = 10 * 1024 * 1024;

/// Unique photo identifier, assigned at ingest and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(Uuid);

impl PhotoId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PhotoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PhotoId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Image formats accepted on the wall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ContentType {
    /// Parse a MIME type as sent by browsers. Parameters after `;` are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    /// Short name used in storage columns
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "gif" => Ok(Self::Gif),
            "webp" => Ok(Self::Webp),
            other => Self::from_mime(other).ok_or_else(|| other.to_string()),
        }
    }
}

/// Opaque reference to stored image bytes.
///
/// For object storage this is the object key; for the local backend it is the
/// inlined `data:` URI itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total order of records: upload time, then insertion sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub uploaded_at: DateTime<Utc>,
    pub seq: i64,
}

/// Metadata for one photo on the wall
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Unique photo ID
    pub id: PhotoId,
    /// Where the image bytes live
    pub blob_ref: BlobRef,
    /// Name supplied by the uploader, informational only
    pub original_filename: String,
    /// Image size in bytes
    pub size_bytes: u64,
    /// Image format
    pub content_type: ContentType,
    /// Optional attribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_label: Option<String>,
    /// Assigned by the record store at insert time
    pub uploaded_at: DateTime<Utc>,
    /// Store-assigned insertion sequence, breaks `uploaded_at` ties
    pub seq: i64,
}

impl PhotoRecord {
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            uploaded_at: self.uploaded_at,
            seq: self.seq,
        }
    }
}

/// A record as handed to the record store, before the store stamps it
#[derive(Debug, Clone)]
pub struct NewPhotoRecord {
    pub id: PhotoId,
    pub blob_ref: BlobRef,
    pub original_filename: String,
    pub size_bytes: u64,
    pub content_type: ContentType,
    pub uploader_label: Option<String>,
}

impl NewPhotoRecord {
    pub fn into_record(self, uploaded_at: DateTime<Utc>, seq: i64) -> PhotoRecord {
        PhotoRecord {
            id: self.id,
            blob_ref: self.blob_ref,
            original_filename: self.original_filename,
            size_bytes: self.size_bytes,
            content_type: self.content_type,
            uploader_label: self.uploader_label,
            uploaded_at,
            seq,
        }
    }
}

/// Sort records newest first by their total order
pub fn sort_newest_first(records: &mut [PhotoRecord]) {
    records.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
}

/// Generate the blob path for a new photo.
///
/// Format: `photos/{date}/{time}_{id}.{ext}`. The date prefix keeps listings
/// and lifecycle rules cheap, the time keeps keys sortable, the id keeps them
/// unique.
pub fn blob_path(id: PhotoId, content_type: ContentType, at: DateTime<Utc>) -> String {
    format!(
        "photos/{date}/{time}_{id}.{ext}",
        date = at.format("%Y-%m-%d"),
        time = at.format("%H%M%S%3f"),
        id = id,
        ext = content_type.extension()
    )
}
