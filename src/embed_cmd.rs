//! Embedding regeneration for events that have none yet.
//!
//! Embeds every event at or after `since` with no stored embedding, saving
//! the blob, the context text and its SHA-256 hash. Cancellation is
//! checked between batches. The vector index is reloaded at the end so
//! suggestions see the new vectors.

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use traq_attribution_core::context::AssignmentContext;
use traq_attribution_core::embedding::{build_context_text, context_hash, vec_to_blob};
use traq_attribution_core::store::Store;

use crate::assignment::AssignmentService;
use crate::backfill::parse_local_date;
use crate::config::Config;
use crate::embedding::embed_batch;
use crate::progress::{BatchProgressEvent, ProgressMode, ProgressReporter};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegenerationReport {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Embed and persist every missing event embedding since `since`.
pub async fn regenerate_embeddings(
    service: &AssignmentService,
    since: i64,
    batch_size: usize,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<RegenerationReport> {
    let store = service.store();
    let pending = store.events_without_embeddings(since).await?;

    let mut report = RegenerationReport {
        total: pending.len(),
        ..Default::default()
    };

    for batch in pending.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let texts: Vec<String> = batch
            .iter()
            .map(|event| build_context_text(&AssignmentContext::from_event(event)))
            .collect();
        let vectors = embed_batch(service.embedder(), texts.clone()).await;

        for ((event, text), vector) in batch.iter().zip(&texts).zip(&vectors) {
            let blob = vec_to_blob(vector);
            match store
                .save_embedding(event.event_type, event.id, &blob, text, &context_hash(text))
                .await
            {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(
                        error = %format!("{:#}", e),
                        event_type = %event.event_type,
                        event_id = event.id,
                        "failed to store embedding"
                    );
                    report.failed += 1;
                }
            }
        }

        progress.report(BatchProgressEvent::Processing {
            job: "embed",
            event_type: None,
            n: (report.processed + report.failed) as u64,
            total: report.total as u64,
        });
    }

    let indexed = service.reload_vectors().await?;
    info!(
        total = report.total,
        processed = report.processed,
        failed = report.failed,
        cancelled = report.cancelled,
        indexed,
        "embedding regeneration finished"
    );
    Ok(report)
}

/// CLI entry point for `traq embed regenerate`.
pub async fn run_embed_regenerate(
    config: &Config,
    since: Option<String>,
    batch_size_override: Option<usize>,
    progress: ProgressMode,
    cancel: &CancellationToken,
) -> Result<()> {
    let since_ts = match since.as_deref() {
        Some(date) => parse_local_date("since", date)?,
        None => 0,
    };
    let batch_size = batch_size_override.unwrap_or(config.backfill.batch_size);

    let service = AssignmentService::open(config).await?;
    let reporter = progress.reporter();
    let report = regenerate_embeddings(&service, since_ts, batch_size, cancel, reporter.as_ref()).await?;

    println!("embed regenerate");
    println!("  strategy: {}", service.embedder().active_strategy());
    if report.total == 0 {
        println!("  all events have embeddings");
        return Ok(());
    }
    println!("  total pending: {}", report.total);
    println!("  embedded: {}", report.processed);
    println!("  failed: {}", report.failed);
    println!("  labeled vectors: {}", service.index().len());
    if report.cancelled {
        println!("  cancelled before completion");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use traq_attribution_core::embedding::Embedder;
    use traq_attribution_core::models::{ActivityEvent, AssignmentSource, EventType};
    use traq_attribution_core::store::memory::InMemoryStore;

    use crate::progress::NoProgress;

    fn service() -> AssignmentService {
        let config = Config::minimal(":memory:");
        AssignmentService::with_embedder(
            Arc::new(InMemoryStore::new()),
            &config,
            Embedder::pseudo(config.embedding.dims),
        )
    }

    async fn add_focus(svc: &AssignmentService, ts: i64, app: &str, title: &str) -> i64 {
        let mut e = ActivityEvent::new(EventType::Focus, ts);
        e.app_name = Some(app.into());
        e.window_title = Some(title.into());
        svc.store().insert_event(&e).await.unwrap()
    }

    #[tokio::test]
    async fn test_regenerate_embeds_missing_and_loads_labeled_vectors() {
        let svc = service();
        let p = svc.create_project("Traq", None, "").await.unwrap();
        let a = add_focus(&svc, 100, "Code", "main.go - traq").await;
        add_focus(&svc, 200, "Firefox", "YouTube").await;
        svc.store()
            .set_event_project(EventType::Focus, a, p.id, 1.0, AssignmentSource::User)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let report = regenerate_embeddings(&svc, 0, 1, &cancel, &NoProgress).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.processed, 2);
        assert!(!report.cancelled);
        // Only the assigned event carries a label.
        assert_eq!(svc.index().len(), 1);

        let again = regenerate_embeddings(&svc, 0, 1, &cancel, &NoProgress).await.unwrap();
        assert_eq!(again.total, 0);
    }

    #[tokio::test]
    async fn test_regenerate_respects_since() {
        let svc = service();
        add_focus(&svc, 100, "Code", "old").await;
        add_focus(&svc, 500, "Code", "new").await;

        let report = regenerate_embeddings(&svc, 300, 10, &CancellationToken::new(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.total, 1);
    }

    #[tokio::test]
    async fn test_cancelled_regeneration_writes_nothing() {
        let svc = service();
        add_focus(&svc, 100, "Code", "main.go").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = regenerate_embeddings(&svc, 0, 10, &cancel, &NoProgress).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(svc.store().events_without_embeddings(0).await.unwrap().len(), 1);
    }
}
