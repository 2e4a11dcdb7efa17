//! Boundary to the project backend: fetching generated media and uploading
//! it to the owning project segment.
//!
//! Only success, failure and the `AuthExpired` signal matter to the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::state_machine::MediaKind;

/// A generated artifact on its way out of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryItem {
    /// Resolved result index; stable across retries.
    pub index: usize,
    pub media_ref: String,
    pub media_kind: MediaKind,
    pub segment_key: Option<String>,
}

impl DeliveryItem {
    /// File name derived from the resolved index, 1-based and zero-padded
    /// so retried items overwrite their original slot.
    pub fn file_name(&self) -> String {
        let ext = match self.media_kind {
            MediaKind::Image => "png",
            MediaKind::Video => "mp4",
        };
        format!("{:03}.{ext}", self.index + 1)
    }

    pub fn needs_upload(&self) -> bool {
        self.segment_key.is_some()
    }
}

#[async_trait]
pub trait ProjectBackend: Send + Sync {
    async fn download(&self, item: &DeliveryItem) -> Result<(), DeliveryError>;

    async fn upload(&self, item: &DeliveryItem) -> Result<(), DeliveryError>;
}

/// Backend for runs without a project: nothing to fetch or upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

#[async_trait]
impl ProjectBackend for NoopBackend {
    async fn download(&self, item: &DeliveryItem) -> Result<(), DeliveryError> {
        tracing::debug!(file = %item.file_name(), media_ref = %item.media_ref, "Download skipped");
        Ok(())
    }

    async fn upload(&self, _item: &DeliveryItem) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, kind: MediaKind, segment: Option<&str>) -> DeliveryItem {
        DeliveryItem {
            index,
            media_ref: "blob:x".into(),
            media_kind: kind,
            segment_key: segment.map(str::to_string),
        }
    }

    #[test]
    fn file_name_follows_resolved_index() {
        assert_eq!(item(0, MediaKind::Image, None).file_name(), "001.png");
        assert_eq!(item(41, MediaKind::Video, None).file_name(), "042.mp4");
    }

    #[test]
    fn upload_only_with_segment() {
        assert!(!item(0, MediaKind::Image, None).needs_upload());
        assert!(item(0, MediaKind::Image, Some("seg-9")).needs_upload());
    }

    #[tokio::test]
    async fn noop_backend_accepts_everything() {
        let backend = NoopBackend;
        let it = item(2, MediaKind::Image, Some("seg"));
        assert!(backend.download(&it).await.is_ok());
        assert!(backend.upload(&it).await.is_ok());
    }
}
