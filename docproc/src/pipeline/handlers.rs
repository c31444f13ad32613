//! Built-in stage handlers.
//!
//! These move the document into storage, check it and write one JSON manifest
//! per analysis stage. Content extraction itself is plugged in by registering
//! other handlers for the same stages.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::stage::{ProcessingStage, StageContext, StageError, StageHandler};
use crate::storage::ObjectMetadata;

pub(crate) fn default_handler(stage: ProcessingStage) -> Arc<dyn StageHandler> {
    match stage {
        ProcessingStage::Upload => Arc::new(UploadHandler),
        ProcessingStage::Validation => Arc::new(ValidationHandler),
        ProcessingStage::Extraction | ProcessingStage::Analysis | ProcessingStage::Indexing => {
            Arc::new(ManifestHandler::new(stage))
        }
        ProcessingStage::Completion => Arc::new(CompletionHandler),
    }
}

fn original_key(ctx: &StageContext) -> String {
    format!("{}/original", ctx.request.storage_prefix())
}

fn manifest_key(ctx: &StageContext, stage: ProcessingStage) -> String {
    format!("{}/{}.json", ctx.request.storage_prefix(), stage)
}

fn max_bytes(ctx: &StageContext) -> u64 {
    ctx.max_file_size_mb.saturating_mul(1024 * 1024)
}

/// Copies the source file into object storage.
pub struct UploadHandler;

#[async_trait]
impl StageHandler for UploadHandler {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        let path = &ctx.request.file_path;
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageError::permanent(format!("source file not found: {}", path)));
            }
            Err(e) => return Err(StageError::transient(format!("stat {}: {}", path, e))),
        };
        if size > max_bytes(ctx) {
            return Err(StageError::permanent(format!(
                "file is {} bytes, limit is {} MB",
                size, ctx.max_file_size_mb
            )));
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::transient(format!("reading {}: {}", path, e)))?;
        ctx.report_progress(0.5, None).await;

        let mut metadata = ObjectMetadata::new();
        metadata.insert("documentId".into(), ctx.request.document_id.clone().into());
        metadata.insert("documentType".into(), ctx.request.document_type.as_str().into());
        metadata.insert("sourcePath".into(), path.clone().into());
        metadata.insert("uploadedAt".into(), Utc::now().to_rfc3339().into());

        let key = original_key(ctx);
        let bytes = data.len();
        ctx.storage
            .write_object(&key, Bytes::from(data), metadata)
            .await?;

        info!(job_id = %ctx.job_id, key = %key, bytes, "Document uploaded");
        Ok(json!({ "key": key, "bytes": bytes }))
    }
}

/// Rejects empty, oversized or mislabelled documents.
pub struct ValidationHandler;

impl ValidationHandler {
    fn check(ctx: &StageContext, data: &[u8]) -> Result<(), StageError> {
        let doc_type = ctx.request.document_type;
        if data.is_empty() {
            return Err(StageError::permanent("document is empty"));
        }
        if data.len() as u64 > max_bytes(ctx) {
            return Err(StageError::permanent(format!(
                "document exceeds {} MB",
                ctx.max_file_size_mb
            )));
        }
        if let Some(magic) = doc_type.magic()
            && !data.starts_with(magic)
        {
            return Err(StageError::permanent(format!(
                "document does not look like {}",
                doc_type
            )));
        }
        if doc_type.magic().is_none() && std::str::from_utf8(data).is_err() {
            return Err(StageError::permanent(format!(
                "{} document is not valid UTF-8",
                doc_type
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for ValidationHandler {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        let data = ctx.storage.read_object(&original_key(ctx)).await?;
        Self::check(ctx, &data)?;
        debug!(job_id = %ctx.job_id, bytes = data.len(), "Document validated");
        Ok(json!({ "valid": true, "bytes": data.len() }))
    }
}

/// Writes a JSON manifest describing what the stage was asked to do.
pub struct ManifestHandler {
    stage: ProcessingStage,
}

impl ManifestHandler {
    pub fn new(stage: ProcessingStage) -> Self {
        Self { stage }
    }

    fn manifest(&self, ctx: &StageContext, bytes: usize) -> serde_json::Value {
        let request = &ctx.request;
        let mut manifest = json!({
            "stage": self.stage.as_str(),
            "documentId": request.document_id,
            "documentType": request.document_type,
            "bytes": bytes,
            "attempt": ctx.attempt,
            "generatedAt": Utc::now().to_rfc3339(),
        });
        let details = match self.stage {
            ProcessingStage::Extraction => json!({
                "extractText": request.extract_text,
                "extractMetadata": request.extract_metadata,
                "generateThumbnails": request.generate_thumbnails,
            }),
            ProcessingStage::Analysis => json!({
                "extractEntities": request.extract_entities,
            }),
            _ => json!({ "options": request.options }),
        };
        if let (Some(obj), serde_json::Value::Object(extra)) = (manifest.as_object_mut(), details) {
            obj.extend(extra);
        }
        manifest
    }
}

#[async_trait]
impl StageHandler for ManifestHandler {
    fn name(&self) -> &'static str {
        self.stage.as_str()
    }

    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        let data = ctx.storage.read_object(&original_key(ctx)).await?;
        ctx.report_progress(0.5, None).await;

        let manifest = self.manifest(ctx, data.len());
        let key = manifest_key(ctx, self.stage);
        let body = serde_json::to_vec(&manifest).map_err(|e| StageError::permanent(e.to_string()))?;

        let mut metadata = ObjectMetadata::new();
        metadata.insert("stage".into(), self.stage.as_str().into());
        ctx.storage
            .write_object(&key, Bytes::from(body), metadata)
            .await?;

        Ok(json!({ "key": key }))
    }
}

/// Checks every stage artifact exists and writes the job summary.
pub struct CompletionHandler;

#[async_trait]
impl StageHandler for CompletionHandler {
    fn name(&self) -> &'static str {
        "completion"
    }

    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, StageError> {
        let mut artifacts = vec![original_key(ctx)];
        for stage in [
            ProcessingStage::Extraction,
            ProcessingStage::Analysis,
            ProcessingStage::Indexing,
        ] {
            let key = manifest_key(ctx, stage);
            ctx.storage.read_object(&key).await?;
            artifacts.push(key);
        }

        let summary = json!({
            "jobId": ctx.job_id,
            "documentId": ctx.request.document_id,
            "artifacts": artifacts,
            "completedAt": Utc::now().to_rfc3339(),
        });
        let key = format!("{}/summary.json", ctx.request.storage_prefix());
        let body = serde_json::to_vec(&summary).map_err(|e| StageError::permanent(e.to_string()))?;
        ctx.storage
            .write_object(&key, Bytes::from(body), ObjectMetadata::new())
            .await?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::{DocumentType, ProcessingRequest};
    use crate::progress::{ProgressTracker, TrackerConfig};
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use tempfile::TempDir;

    fn context(
        stage: ProcessingStage,
        request: ProcessingRequest,
        storage: Arc<MemoryObjectStore>,
    ) -> StageContext {
        StageContext {
            job_id: "job".into(),
            task_id: "task".into(),
            stage,
            request,
            storage,
            attempt: 0,
            max_file_size_mb: 1,
            tracker: Arc::new(ProgressTracker::new(TrackerConfig::default())),
        }
    }

    #[tokio::test]
    async fn test_full_default_chain() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("paper.pdf");
        std::fs::write(&file, b"%PDF-1.7 body").unwrap();

        let storage = Arc::new(MemoryObjectStore::new());
        let request = ProcessingRequest::new("doc-1", file.to_string_lossy(), DocumentType::Pdf);

        for stage in ProcessingStage::ALL {
            let ctx = context(stage, request.clone(), storage.clone());
            default_handler(stage).run(&ctx).await.unwrap();
        }

        let keys = storage.keys();
        assert!(keys.contains(&"documents/doc-1/original".to_string()));
        assert!(keys.contains(&"documents/doc-1/extraction.json".to_string()));
        assert!(keys.contains(&"documents/doc-1/summary.json".to_string()));
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let storage = Arc::new(MemoryObjectStore::new());
        let request = ProcessingRequest::new("doc", "/definitely/not/here.pdf", DocumentType::Pdf);
        let ctx = context(ProcessingStage::Upload, request, storage);
        let err = UploadHandler.run(&ctx).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_validation_rejects_wrong_magic() {
        let storage = Arc::new(MemoryObjectStore::new());
        storage
            .write_object("documents/doc/original", Bytes::from_static(b"hello"), ObjectMetadata::new())
            .await
            .unwrap();
        let request = ProcessingRequest::new("doc", "/tmp/x.pdf", DocumentType::Pdf);
        let ctx = context(ProcessingStage::Validation, request, storage.clone());
        let err = ValidationHandler.run(&ctx).await.unwrap_err();
        assert!(!err.retryable);

        let request = ProcessingRequest::new("doc", "/tmp/x.txt", DocumentType::Txt);
        let ctx = context(ProcessingStage::Validation, request, storage);
        assert!(ValidationHandler.run(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_without_upload_is_not_retried() {
        let storage = Arc::new(MemoryObjectStore::new());
        let request = ProcessingRequest::new("doc", "/tmp/x.txt", DocumentType::Txt);
        let ctx = context(ProcessingStage::Validation, request, storage);
        let err = ValidationHandler.run(&ctx).await.unwrap_err();
        assert!(!err.retryable);
    }
}
