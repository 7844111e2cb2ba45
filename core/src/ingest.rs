//! Slip ingestion: validate the upload, store the image, create the
//! slip record, and wake the payer's dues.
//!
//! Side-effect contract: exactly one blob write and one slip row per
//! successful call. Validation and storage failures leave nothing
//! behind — the caller retries the whole upload.

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::ports::BlobStore;
use crate::slip::{SlipRecord, SlipStatus};
use crate::store::EngineStore;
use crate::types::EntityId;
use std::sync::Arc;

pub struct SlipIngestor {
    config: IngestConfig,
    clock: Arc<dyn Clock>,
}

impl SlipIngestor {
    pub fn new(config: IngestConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn submit(
        &self,
        store: &EngineStore,
        blob: &mut dyn BlobStore,
        claimed_payer_id: &str,
        image_bytes: &[u8],
        content_type: &str,
    ) -> EngineResult<EntityId> {
        self.validate(image_bytes, content_type)?;

        let image_ref = blob
            .put(image_bytes, content_type)
            .map_err(EngineError::StorageUnavailable)?;

        let now = self.clock.now_unix();
        let slip = SlipRecord {
            slip_id: crate::store::entity_id(),
            claimed_payer_id: claimed_payer_id.to_string(),
            image_ref: image_ref.clone(),
            uploaded_at: now,
            status: SlipStatus::Pending,
            provider_txn_ref: None,
            verified_amount_cents: None,
            verified_at: None,
            settled_at: None,
            failure_reason: None,
            retry_count: 0,
            matched_payment_id: None,
        };
        store.insert_slip(&slip)?;

        // A slip claiming this payer moves their pending dues into
        // awaiting_verification. Idempotent for repeat uploads.
        store.mark_member_awaiting(claimed_payer_id, now)?;

        store.record_event(
            "ingest",
            &EngineEvent::SlipSubmitted {
                slip_id: slip.slip_id.clone(),
                claimed_payer_id: claimed_payer_id.to_string(),
                image_ref,
            },
            now,
        )?;

        log::info!(
            "slip {} submitted by payer {claimed_payer_id} ({} bytes)",
            slip.slip_id,
            image_bytes.len()
        );
        Ok(slip.slip_id)
    }

    fn validate(&self, image_bytes: &[u8], content_type: &str) -> EngineResult<()> {
        if !self
            .config
            .allowed_content_types
            .iter()
            .any(|t| t == content_type)
        {
            return Err(EngineError::InvalidUpload(format!(
                "unsupported content type '{content_type}'"
            )));
        }
        if image_bytes.is_empty() {
            return Err(EngineError::InvalidUpload("empty image".into()));
        }
        if image_bytes.len() > self.config.max_image_bytes {
            return Err(EngineError::InvalidUpload(format!(
                "image is {} bytes, limit is {}",
                image_bytes.len(),
                self.config.max_image_bytes
            )));
        }
        Ok(())
    }
}
