//! Resource identity and metadata records.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::blob::BlobInfo;
use crate::error::StoreError;
use crate::locator::{Handler, Locator};

// =============================================================================
// RowId
// =============================================================================

/// Database row identifier. Zero means "no row".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct RowId(i64);

impl RowId {
    pub const INVALID: RowId = RowId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// The raw id, or [`StoreError::InvalidRowId`] for the zero id.
    pub fn get(&self) -> Result<i64, StoreError> {
        if self.is_valid() {
            Ok(self.0)
        } else {
            Err(StoreError::InvalidRowId)
        }
    }

    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ResourceStatus
// =============================================================================

/// Outcome recorded for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Unknown,
    AccessError,
    UnknownHandler,
    HandlerError,
    Success,
    InProgress,
    Incremental,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Unknown => "unknown",
            ResourceStatus::AccessError => "access_error",
            ResourceStatus::UnknownHandler => "unknown_handler",
            ResourceStatus::HandlerError => "handler_error",
            ResourceStatus::Success => "success",
            ResourceStatus::InProgress => "in_progress",
            ResourceStatus::Incremental => "incremental",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResourceStatus::Success)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(ResourceStatus::Unknown),
            "access_error" => Ok(ResourceStatus::AccessError),
            "unknown_handler" => Ok(ResourceStatus::UnknownHandler),
            "handler_error" => Ok(ResourceStatus::HandlerError),
            "success" => Ok(ResourceStatus::Success),
            "in_progress" => Ok(ResourceStatus::InProgress),
            "incremental" => Ok(ResourceStatus::Incremental),
            other => Err(StoreError::Corrupt(format!("unknown status '{}'", other))),
        }
    }
}

// =============================================================================
// Resource records
// =============================================================================

/// Content identity of a resource: the blob plus the handler that
/// interprets it.
///
/// Two locators that resolve to the same bytes and handler are the same
/// resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceName {
    pub blob: BlobInfo,
    #[serde(serialize_with = "serialize_display")]
    pub handler: Handler,
}

impl ResourceName {
    pub fn new(blob: BlobInfo, handler: Handler) -> Self {
        Self { blob, handler }
    }
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// A stored resource row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: RowId,
    pub name: ResourceName,
    pub status: ResourceStatus,
}

/// Dimensions of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Coarsest scale: halve until the image fits a single tile.
    pub fn max_scale(&self, tile_size: u32) -> u32 {
        crate::pyramid::calc_max_scale(self.width, self.height, tile_size)
    }

    /// Image size at `scale`, never below one pixel.
    pub fn scaled_size(&self, scale: u32) -> (u32, u32) {
        (
            crate::pyramid::scaled_dimension(self.width, scale),
            crate::pyramid::scaled_dimension(self.height, scale),
        )
    }

    /// Number of tile columns and rows at `scale`.
    pub fn tile_grid(&self, scale: u32, tile_size: u32) -> (u32, u32) {
        let (w, h) = self.scaled_size(scale);
        (w.div_ceil(tile_size), h.div_ceil(tile_size))
    }
}

/// Everything known about a resolved resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceMetadata {
    pub info: ResourceInfo,
    pub locator: Locator,
    pub image: Option<ImageInfo>,
}

impl ResourceMetadata {
    pub fn id(&self) -> RowId {
        self.info.id
    }
}
