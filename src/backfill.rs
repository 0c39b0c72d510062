//! Batch re-application of the suggestion pipeline to historical events.
//!
//! `traq backfill <start> <end>` walks every event type over a local-date
//! range, oldest first, and for each event that has no project yet tries
//! the rule matcher, then the keyword detector:
//!
//! | Outcome | Counter | Written source (commit mode) |
//! |---------|---------|------------------------------|
//! | Event already has a project | `already_assigned` | untouched |
//! | Rule match at or above threshold | `auto_assigned` | `rule` |
//! | Detector names an existing project | `auto_assigned` | `detection` |
//! | Nothing, or the write failed | `no_match` | untouched |
//!
//! Preview mode performs no writes. Events are processed in batches with
//! the cancellation token checked between batches, so a cancelled run
//! never leaves a batch half-written. Assigned events are skipped, which
//! makes reruns over the same range idempotent.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{Local, NaiveDate, TimeZone};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use traq_attribution_core::context::AssignmentContext;
use traq_attribution_core::detect::ProjectDetector;
use traq_attribution_core::error::ValidationError;
use traq_attribution_core::models::{ActivityEvent, AssignmentSource, BackfillResult, EventType};
use traq_attribution_core::rules::validate_min_confidence;
use traq_attribution_core::store::Store;

use crate::assignment::AssignmentService;
use crate::config::Config;
use crate::progress::{BatchProgressEvent, NoProgress, ProgressMode, ProgressReporter};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Local midnight at the start of a `YYYY-MM-DD` date, as unix seconds.
pub fn parse_local_date(field: &'static str, value: &str) -> Result<i64, ValidationError> {
    let invalid = || ValidationError::InvalidDate {
        field,
        value: value.to_string(),
    };
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(invalid)
}

/// `[start, end + 1 day)` for an inclusive pair of local dates.
pub fn date_range(start: &str, end: &str) -> Result<(i64, i64), ValidationError> {
    let start_ts = parse_local_date("start", start)?;
    let end_ts = parse_local_date("end", end)? + SECONDS_PER_DAY;
    Ok((start_ts, end_ts))
}

enum Outcome {
    AlreadyAssigned,
    Assigned,
    NoMatch,
}

pub struct BackfillRunner<'a> {
    service: &'a AssignmentService,
    batch_size: usize,
    progress: Box<dyn ProgressReporter>,
}

impl<'a> BackfillRunner<'a> {
    pub fn new(service: &'a AssignmentService, batch_size: usize) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Suggest (and with `commit`, write) projects for events between two
    /// inclusive local dates.
    pub async fn run(
        &self,
        start: &str,
        end: &str,
        min_confidence: f64,
        commit: bool,
        cancel: &CancellationToken,
    ) -> Result<BackfillResult> {
        let (start_ts, end_ts) = date_range(start, end)?;
        let min_confidence = validate_min_confidence(min_confidence)?;
        self.run_range(start_ts, end_ts, min_confidence, commit, cancel)
            .await
    }

    pub async fn preview(
        &self,
        start: &str,
        end: &str,
        min_confidence: f64,
        cancel: &CancellationToken,
    ) -> Result<BackfillResult> {
        self.run(start, end, min_confidence, false, cancel).await
    }

    pub async fn commit(
        &self,
        start: &str,
        end: &str,
        min_confidence: f64,
        cancel: &CancellationToken,
    ) -> Result<BackfillResult> {
        self.run(start, end, min_confidence, true, cancel).await
    }

    /// Same as [`run`](Self::run) over `start <= timestamp < end`.
    pub async fn run_range(
        &self,
        start: i64,
        end: i64,
        min_confidence: f64,
        commit: bool,
        cancel: &CancellationToken,
    ) -> Result<BackfillResult> {
        let store = self.service.store();

        // Pick up rules written since the cache was last loaded.
        self.service.cache().force_refresh().await;
        let detector = self.service.detector().await?;
        let project_ids: HashMap<String, i64> = store
            .list_projects()
            .await?
            .into_iter()
            .map(|p| (p.name.to_lowercase(), p.id))
            .collect();

        let mut result = BackfillResult::default();

        'types: for event_type in EventType::ALL {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            self.progress.report(BatchProgressEvent::Scanning {
                job: "backfill",
                event_type,
            });

            let events = store.events_in_range(event_type, start, end).await?;
            let total = events.len() as u64;
            let mut done = 0u64;

            for batch in events.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break 'types;
                }

                for event in batch {
                    let outcome = self
                        .process(event, &detector, &project_ids, min_confidence, commit)
                        .await;
                    result.total_processed += 1;
                    match outcome {
                        Outcome::AlreadyAssigned => result.already_assigned += 1,
                        Outcome::Assigned => result.auto_assigned += 1,
                        Outcome::NoMatch => result.no_match += 1,
                    }
                }

                done += batch.len() as u64;
                self.progress.report(BatchProgressEvent::Processing {
                    job: "backfill",
                    event_type: Some(event_type),
                    n: done,
                    total,
                });
            }
        }

        info!(
            commit,
            processed = result.total_processed,
            auto_assigned = result.auto_assigned,
            already_assigned = result.already_assigned,
            no_match = result.no_match,
            cancelled = result.cancelled,
            "backfill finished"
        );
        Ok(result)
    }

    async fn process(
        &self,
        event: &ActivityEvent,
        detector: &ProjectDetector,
        project_ids: &HashMap<String, i64>,
        min_confidence: f64,
        commit: bool,
    ) -> Outcome {
        if event.is_assigned() {
            return Outcome::AlreadyAssigned;
        }

        let ctx = AssignmentContext::from_event(event);
        if ctx.is_empty() {
            return Outcome::NoMatch;
        }

        let Some((project_id, confidence, source)) = self.decide(&ctx, detector, project_ids, min_confidence)
        else {
            return Outcome::NoMatch;
        };

        if !commit {
            return Outcome::Assigned;
        }

        match self
            .service
            .store()
            .set_event_project(event.event_type, event.id, project_id, confidence, source)
            .await
        {
            Ok(()) => {
                debug!(
                    event_type = %event.event_type,
                    event_id = event.id,
                    project_id,
                    %source,
                    "backfill assigned event"
                );
                Outcome::Assigned
            }
            Err(e) => {
                warn!(
                    error = %format!("{:#}", e),
                    event_type = %event.event_type,
                    event_id = event.id,
                    "backfill write failed"
                );
                Outcome::NoMatch
            }
        }
    }

    fn decide(
        &self,
        ctx: &AssignmentContext,
        detector: &ProjectDetector,
        project_ids: &HashMap<String, i64>,
        min_confidence: f64,
    ) -> Option<(i64, f64, AssignmentSource)> {
        if let Some(m) = self.service.cache().match_context(ctx) {
            if m.confidence >= min_confidence {
                return Some((m.project_id, m.confidence, AssignmentSource::Rule));
            }
        }

        let detection = detector.detect(ctx)?;
        let project_id = project_ids.get(&detection.project_name.to_lowercase())?;
        Some((*project_id, detection.confidence, AssignmentSource::Detection))
    }
}

/// CLI entry point for `traq backfill`.
pub async fn run_backfill(
    config: &Config,
    start: &str,
    end: &str,
    min_confidence: Option<f64>,
    commit: bool,
    progress: ProgressMode,
    cancel: &CancellationToken,
) -> Result<()> {
    let min_confidence = min_confidence.map(validate_min_confidence).transpose()?;
    let service = AssignmentService::open(config).await?;
    let min_confidence = min_confidence.unwrap_or_else(|| service.min_confidence());
    let runner = BackfillRunner::new(&service, config.backfill.batch_size).with_progress(progress.reporter());

    let result = runner.run(start, end, min_confidence, commit, cancel).await?;

    if commit {
        println!("backfill {} .. {}", start, end);
    } else {
        println!("backfill {} .. {} (preview)", start, end);
    }
    println!("  processed: {}", result.total_processed);
    println!("  auto-assigned: {}", result.auto_assigned);
    println!("  already assigned: {}", result.already_assigned);
    println!("  no match: {}", result.no_match);
    if result.cancelled {
        println!("  cancelled before completion");
    }
    if !commit && result.auto_assigned > 0 {
        println!("  rerun with --commit to write these assignments");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use traq_attribution_core::embedding::Embedder;
    use traq_attribution_core::rules::RuleInput;
    use traq_attribution_core::store::memory::InMemoryStore;

    fn service(keywords: &[(&str, &str)]) -> AssignmentService {
        let mut config = Config::minimal(":memory:");
        for (k, v) in keywords {
            config.detection.keywords.insert(k.to_string(), v.to_string());
        }
        AssignmentService::with_embedder(
            Arc::new(InMemoryStore::new()),
            &config,
            Embedder::pseudo(config.embedding.dims),
        )
    }

    fn day(date: &str) -> i64 {
        parse_local_date("start", date).unwrap()
    }

    async fn add_focus(svc: &AssignmentService, ts: i64, app: &str, title: &str) -> i64 {
        let mut e = ActivityEvent::new(EventType::Focus, ts);
        e.app_name = Some(app.into());
        e.window_title = Some(title.into());
        svc.store().insert_event(&e).await.unwrap()
    }

    async fn add_app_rule(svc: &AssignmentService, project_id: i64, app: &str, weight: f64) {
        svc.create_rule(&RuleInput {
            project_id: Some(project_id),
            pattern_type: Some("app_name".into()),
            pattern_value: Some(app.into()),
            weight: Some(weight),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_parse_local_date() {
        assert!(parse_local_date("start", "2024-03-01").is_ok());
        let err = parse_local_date("end", "03/01/2024").unwrap_err();
        assert_eq!(err.field(), "end");
        assert!(parse_local_date("start", "2024-02-30").is_err());
    }

    #[test]
    fn test_end_date_is_inclusive() {
        let (start, end) = date_range("2024-03-01", "2024-03-01").unwrap();
        assert_eq!(end - start, SECONDS_PER_DAY);
    }

    #[tokio::test]
    async fn test_commit_then_rerun_is_idempotent() {
        let svc = service(&[]);
        let p = svc.create_project("Traq", None, "").await.unwrap();
        add_app_rule(&svc, p.id, "code", 3.0).await;
        let base = day("2024-03-01");
        add_focus(&svc, base + 60, "Code", "main.rs").await;
        add_focus(&svc, base + 120, "Code", "lib.rs").await;
        add_focus(&svc, base + 180, "Slack", "general").await;

        let runner = BackfillRunner::new(&svc, 2);
        let cancel = CancellationToken::new();
        let first = runner.commit("2024-03-01", "2024-03-01", 0.5, &cancel).await.unwrap();
        assert_eq!(first.total_processed, 3);
        assert_eq!(first.auto_assigned, 2);
        assert_eq!(first.no_match, 1);

        let second = runner.commit("2024-03-01", "2024-03-01", 0.5, &cancel).await.unwrap();
        assert_eq!(second.auto_assigned, 0);
        assert_eq!(second.already_assigned, first.already_assigned + first.auto_assigned);
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let svc = service(&[]);
        let p = svc.create_project("Traq", None, "").await.unwrap();
        add_app_rule(&svc, p.id, "code", 3.0).await;
        let id = add_focus(&svc, day("2024-03-01") + 60, "Code", "main.rs").await;

        let runner = BackfillRunner::new(&svc, 100);
        let result = runner
            .preview("2024-03-01", "2024-03-02", 0.5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.auto_assigned, 1);

        let event = svc.store().get_event(EventType::Focus, id).await.unwrap().unwrap();
        assert!(!event.is_assigned());
    }

    #[tokio::test]
    async fn test_rule_below_threshold_falls_back_to_detector() {
        let svc = service(&[("traq", "Traq")]);
        let traq = svc.create_project("Traq", None, "").await.unwrap();
        let other = svc.create_project("Other", None, "").await.unwrap();
        // 0.3 / 3.0 = 0.1 confidence, below the 0.5 threshold.
        add_app_rule(&svc, other.id, "code", 0.3).await;
        let id = add_focus(&svc, day("2024-03-01") + 60, "Code", "main.go - traq").await;

        let runner = BackfillRunner::new(&svc, 100);
        let result = runner
            .commit("2024-03-01", "2024-03-01", 0.5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.auto_assigned, 1);

        let event = svc.store().get_event(EventType::Focus, id).await.unwrap().unwrap();
        assert_eq!(event.project_id, Some(traq.id));
        assert_eq!(event.project_source.as_deref(), Some("detection"));
        assert_eq!(event.project_confidence, Some(0.8));
    }

    #[tokio::test]
    async fn test_detection_of_unknown_project_is_no_match() {
        let svc = service(&[("ledger", "Accounting")]);
        add_focus(&svc, day("2024-03-01") + 60, "Code", "ledger.rs").await;

        let result = BackfillRunner::new(&svc, 100)
            .commit("2024-03-01", "2024-03-01", 0.5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.no_match, 1);
        assert_eq!(result.auto_assigned, 0);
    }

    #[tokio::test]
    async fn test_events_outside_range_are_ignored() {
        let svc = service(&[]);
        let p = svc.create_project("Traq", None, "").await.unwrap();
        add_app_rule(&svc, p.id, "code", 3.0).await;
        add_focus(&svc, day("2024-03-05") + 60, "Code", "main.rs").await;

        let result = BackfillRunner::new(&svc, 100)
            .commit("2024-03-01", "2024-03-04", 0.5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.total_processed, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_writing() {
        let svc = service(&[]);
        let p = svc.create_project("Traq", None, "").await.unwrap();
        add_app_rule(&svc, p.id, "code", 3.0).await;
        let id = add_focus(&svc, day("2024-03-01") + 60, "Code", "main.rs").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = BackfillRunner::new(&svc, 100)
            .commit("2024-03-01", "2024-03-01", 0.5, &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.total_processed, 0);
        let event = svc.store().get_event(EventType::Focus, id).await.unwrap().unwrap();
        assert!(!event.is_assigned());
    }

    #[tokio::test]
    async fn test_invalid_dates_are_validation_errors() {
        let svc = service(&[]);
        let err = BackfillRunner::new(&svc, 100)
            .preview("yesterday", "2024-03-01", 0.5, &CancellationToken::new())
            .await
            .unwrap_err();
        let v = err.downcast_ref::<ValidationError>().unwrap();
        assert_eq!(v.field(), "start");
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let svc = service(&[]);
        let p = svc.create_project("Traq", None, "").await.unwrap();
        add_app_rule(&svc, p.id, "code", 3.0).await;
        let id = add_focus(&svc, day("2024-03-01") + 60, "Code", "main.rs").await;

        let err = BackfillRunner::new(&svc, 100)
            .commit("2024-03-01", "2024-03-01", 1.5, &CancellationToken::new())
            .await
            .unwrap_err();
        let v = err.downcast_ref::<ValidationError>().unwrap();
        assert_eq!(v.field(), "min_confidence");

        let event = svc.store().get_event(EventType::Focus, id).await.unwrap().unwrap();
        assert!(!event.is_assigned());
    }
}
