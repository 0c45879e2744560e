// src/pipeline/controller.rs

//! Pagination controller.
//!
//! Drives the fetch, extract, sink, checkpoint, advance loop for one target.
//! Every transport call is awaited in turn; nothing is spawned.
//!
//! ```text
//! INIT -> PAGING -> DRAINING_EXPANSIONS -> PAGING | DONE
//!                                       -> STALLED -> RECOVERING -> PAGING
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{Checkpoint, Config, ExpansionJob, IdentityMismatch, Record, RequestTemplate};
use crate::services::{Extraction, Extractor, TemplateManager};
use crate::storage::{CheckpointStore, DedupIndex, DumpWriter, LocalStorage, RecordSink};
use crate::transport::{RequestFilter, Transport};
use crate::utils::pause;

use super::expansion::ExpansionQueue;
use super::stall::{RecoveryStrategy, StallDetector, StallStatus};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The endpoint reported no further page
    Exhausted,
    /// The next cursor equals the one just used
    CursorNotAdvancing,
    /// The next cursor was already used earlier in this run
    CursorRepeated,
    /// A page stayed unparseable after cleanup
    ParseFailure,
    /// `max_pages` reached
    PageLimit,
    /// `max_idle_rounds` reached
    IdleLimit,
}

impl TerminationReason {
    /// Loop fuses are deliberate stops, not failures.
    pub fn is_fuse(&self) -> bool {
        matches!(
            self,
            TerminationReason::CursorNotAdvancing | TerminationReason::CursorRepeated
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::Exhausted => "feed exhausted",
            TerminationReason::CursorNotAdvancing => "cursor did not advance",
            TerminationReason::CursorRepeated => "cursor repeated",
            TerminationReason::ParseFailure => "unparseable page",
            TerminationReason::PageLimit => "page limit reached",
            TerminationReason::IdleLimit => "idle limit reached",
        };
        f.write_str(text)
    }
}

/// Controller states, recorded in the order they were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Init,
    Paging,
    DrainingExpansions,
    Stalled,
    Recovering,
    Done(TerminationReason),
}

/// Counters accumulated during one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounts {
    /// Top-level pages processed
    pub pages: usize,
    /// New top-level records appended to the log
    pub records_written: usize,
    /// New nested replies appended to the log
    pub replies_written: usize,
    /// Records skipped because their resource id was already logged
    pub duplicates: usize,
    /// Expansion jobs fully drained
    pub expansions_drained: usize,
    /// Expansion jobs given up after a transport or parse failure
    pub expansions_abandoned: usize,
    pub recoveries: usize,
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub target: String,
    pub reason: TerminationReason,
    #[serde(flatten)]
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn log(&self) {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        log::info!("Harvest of '{}' done: {}", self.target, self.reason);
        log::info!("  pages processed:    {}", self.counts.pages);
        log::info!("  records written:    {}", self.counts.records_written);
        log::info!("  replies written:    {}", self.counts.replies_written);
        log::info!("  duplicates skipped: {}", self.counts.duplicates);
        log::info!("  expansions drained: {}", self.counts.expansions_drained);
        if self.counts.expansions_abandoned > 0 {
            log::info!("  expansions failed:  {}", self.counts.expansions_abandoned);
        }
        log::info!("  recoveries:         {}", self.counts.recoveries);
        log::info!("  elapsed:            {:.1}s", elapsed);
    }
}

/// Mutable state of one run, owned by the controller.
struct RunState {
    template: RequestTemplate,
    cursor: Option<String>,
    seen_cursors: HashSet<String>,
    index: DedupIndex,
    checkpoint: Checkpoint,
    sink: RecordSink,
    queue: ExpansionQueue,
    stall: StallDetector,
    counts: RunCounts,
    transport_failures: usize,
    idle_rounds: usize,
}

impl RunState {
    /// A cursor worth following: new to this run and not the current one.
    fn usable(&self, next: &str) -> bool {
        self.cursor.as_deref() != Some(next) && !self.seen_cursors.contains(next)
    }

    fn advance(&mut self, next: String) {
        self.seen_cursors.insert(next.clone());
        self.cursor = Some(next);
    }

    /// Append unseen records; returns how many were new.
    async fn append(&mut self, records: Vec<Record>) -> Result<usize> {
        let offered = records.len();
        let accepted = self.sink.accept(&mut self.index, records).await?.len();
        self.counts.duplicates += offered - accepted;
        Ok(accepted)
    }

    fn enqueue(&mut self, jobs: Vec<ExpansionJob>) {
        let queued = self.queue.enqueue_all(jobs);
        if queued > 0 {
            log::debug!("Queued {} reply thread(s)", queued);
        }
    }
}

/// Resumable harvester for one target over one transport session.
pub struct Harvester<T: Transport> {
    config: Config,
    transport: T,
    templates: TemplateManager,
    extractor: Extractor,
    checkpoints: CheckpointStore,
    dumps: DumpWriter,
    fresh: bool,
    history: Vec<HarvestState>,
}

impl<T: Transport> Harvester<T> {
    pub fn new(config: Config, transport: T) -> Self {
        let templates = TemplateManager::new(
            &config.template,
            config.harvest.page_size_floor,
            config.expansion.clone(),
        );
        let extractor = Extractor::new(config.extraction.clone());
        let checkpoints = CheckpointStore::new(config.paths.checkpoint.clone());
        let dumps = DumpWriter::new(config.paths.dump_dir.clone());
        Self {
            config,
            transport,
            templates,
            extractor,
            checkpoints,
            dumps,
            fresh: false,
            history: Vec::new(),
        }
    }

    /// Ignore a stored cursor and start from a freshly discovered request.
    /// The dedup index is still seeded, so nothing is written twice.
    pub fn fresh_start(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// States entered during the last run.
    pub fn history(&self) -> &[HarvestState] {
        &self.history
    }

    /// Harvest until a termination condition is met.
    ///
    /// Only template errors, storage errors and an exhausted transport
    /// recovery budget end the run with an error; everything else ends it
    /// with a [`TerminationReason`].
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started_at = Utc::now();
        self.history.clear();
        self.enter(HarvestState::Init);

        let mut run = self.init().await?;
        let reason = self.paginate(&mut run).await?;
        self.enter(HarvestState::Done(reason));

        let summary = RunSummary {
            target: self.config.target.id.clone(),
            reason,
            counts: run.counts,
            started_at,
            finished_at: Utc::now(),
        };
        self.write_summary(&summary).await;
        summary.log();
        Ok(summary)
    }

    fn enter(&mut self, state: HarvestState) {
        if self.history.last() != Some(&state) {
            log::debug!("State -> {:?}", state);
            self.history.push(state);
        }
    }

    async fn init(&mut self) -> Result<RunState> {
        let sink = RecordSink::open(self.config.paths.output_log.clone()).await?;
        let checkpoint = self.checkpoints.load().await?.unwrap_or_default();

        let mut index = DedupIndex::new();
        index.extend(checkpoint.dedup_keys.iter().cloned());
        let from_log = sink.seed_index(&mut index).await?;
        log::info!(
            "Dedup index holds {} key(s), {} recovered from {}",
            index.len(),
            from_log,
            sink.path().display()
        );

        let (template, cursor) = if checkpoint.is_resumable() && !self.fresh {
            self.resume(&checkpoint).await?
        } else {
            if checkpoint.is_resumable() {
                log::info!("Fresh start requested, stored cursor ignored");
            }
            self.discover().await?
        };

        Ok(RunState {
            template,
            seen_cursors: cursor.iter().cloned().collect(),
            cursor,
            index,
            checkpoint,
            sink,
            queue: ExpansionQueue::new(),
            stall: StallDetector::new(self.config.harvest.no_progress_limit),
            counts: RunCounts::default(),
            transport_failures: 0,
            idle_rounds: 0,
        })
    }

    /// Capture the feed's pagination request and turn it into a template.
    async fn discover(&mut self) -> Result<(RequestTemplate, Option<String>)> {
        let filter = RequestFilter::from_config(&self.config.target, &self.config.template);
        let timeout = Duration::from_secs(self.config.session.discovery_timeout_secs);
        let descriptor = self.transport.discover_first_request(&filter, timeout).await?;
        let template = RequestTemplate::from_descriptor(&descriptor, &self.config.target.endpoint)?;
        let (template, cursor) = self.templates.adopt(template)?;
        log::info!(
            "Discovered {} (cursor key '{}')",
            template.identity,
            template.cursor_key.as_deref().unwrap_or_default()
        );
        Ok((template, cursor))
    }

    async fn resume(&mut self, checkpoint: &Checkpoint) -> Result<(RequestTemplate, Option<String>)> {
        let mut stored = checkpoint
            .vars_template
            .clone()
            .ok_or_else(|| AppError::template("checkpoint carries no template"))?;
        stored.cursor_key = checkpoint.cursor_key.clone();
        let stored = self.templates.snapshot(&stored);
        let cursor = checkpoint.cursor.clone();
        log::info!(
            "Resuming {} at cursor {} ({} page(s) committed so far)",
            stored.identity,
            preview(cursor.as_deref()),
            checkpoint.pages_committed
        );

        if !self.config.harvest.verify_identity {
            return Ok((stored, cursor));
        }

        let (live, live_cursor) = match self.discover().await {
            Ok(found) => found,
            Err(e) if e.is_transport() => {
                log::warn!("Could not verify query identity ({}), keeping checkpoint", e);
                return Ok((stored, cursor));
            }
            Err(e) => return Err(e),
        };
        if checkpoint.matches_identity(&live.identity) {
            return Ok((stored, cursor));
        }

        match self.config.harvest.identity_mismatch {
            IdentityMismatch::TrustCursor => {
                log::warn!(
                    "Query changed from {} to {}; adopting it, keeping the stored cursor",
                    stored.identity,
                    live.identity
                );
                Ok((live, cursor))
            }
            IdentityMismatch::DiscardCursor => {
                log::warn!(
                    "Query changed from {} to {}; restarting from its first page",
                    stored.identity,
                    live.identity
                );
                Ok((live, live_cursor))
            }
        }
    }

    async fn paginate(&mut self, run: &mut RunState) -> Result<TerminationReason> {
        loop {
            self.enter(HarvestState::Paging);
            let Some(body) = self.fetch_page(run).await? else {
                if let Some(reason) = self.ceiling(run) {
                    return Ok(reason);
                }
                continue;
            };

            let page_no = run.checkpoint.pages_committed + 1;
            let (extraction, parse_failed) = match self.extractor.extract(&body) {
                Ok(extraction) => (extraction, false),
                Err(AppError::Parse(message)) => {
                    log::error!("Page {} unparseable after cleanup: {}", page_no, message);
                    self.dumps.dump(&format!("page-{page_no:05}"), &body).await;
                    (Extraction::closed(), true)
                }
                Err(e) => return Err(e),
            };

            run.counts.pages += 1;
            run.checkpoint.pages_committed += 1;
            let next = extraction.continuation().map(str::to_string);
            let new_records = run.append(extraction.records).await?;
            run.counts.records_written += new_records;
            run.enqueue(extraction.expansion_jobs);

            let reason = match next {
                None if parse_failed => Some(TerminationReason::ParseFailure),
                None => {
                    run.cursor = None;
                    Some(TerminationReason::Exhausted)
                }
                Some(next) if run.cursor.as_deref() == Some(next.as_str()) => {
                    log::info!("Cursor did not advance on page {}, stopping", page_no);
                    Some(TerminationReason::CursorNotAdvancing)
                }
                Some(next) if run.seen_cursors.contains(&next) => {
                    log::info!("Cursor on page {} was already used, stopping", page_no);
                    Some(TerminationReason::CursorRepeated)
                }
                Some(next) => {
                    run.advance(next);
                    None
                }
            };

            self.commit(run).await?;
            log::info!(
                "Page {}: {} new record(s), next cursor {}",
                page_no,
                new_records,
                preview(run.cursor.as_deref())
            );

            self.drain_expansions(run).await?;
            if let Some(reason) = reason {
                return Ok(reason);
            }

            match run.stall.record(new_records) {
                StallStatus::Progress => {}
                StallStatus::Idle { consecutive, limit } => {
                    log::debug!("No new records ({}/{})", consecutive, limit);
                }
                StallStatus::Stalled { consecutive } => {
                    self.enter(HarvestState::Stalled);
                    log::warn!("{} consecutive page(s) without new records", consecutive);
                    self.recover(run).await?;
                }
            }

            if let Some(reason) = self.ceiling(run) {
                return Ok(reason);
            }
        }
    }

    /// Replay the current page. `None` means the request failed and a
    /// recovery round ran instead.
    async fn fetch_page(&mut self, run: &mut RunState) -> Result<Option<String>> {
        let request = self
            .templates
            .build_next_request(&run.template, run.cursor.as_deref())?;
        self.pace().await;

        match self.transport.replay(&request).await {
            Ok(body) => {
                run.transport_failures = 0;
                Ok(Some(body))
            }
            Err(e) if e.is_transport() => {
                run.transport_failures += 1;
                let budget = self.config.harvest.max_recovery_attempts;
                if run.transport_failures > budget {
                    log::error!("Transport failed {} time(s) in a row", run.transport_failures);
                    return Err(AppError::RecoveryExhausted {
                        attempts: run.transport_failures,
                        last: e.to_string(),
                    });
                }
                log::warn!(
                    "Page request failed ({}/{}): {}",
                    run.transport_failures,
                    budget,
                    e
                );
                self.recover(run).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn ceiling(&self, run: &RunState) -> Option<TerminationReason> {
        let harvest = &self.config.harvest;
        if harvest.max_pages.is_some_and(|max| run.counts.pages >= max) {
            log::info!("Page limit of {} reached", run.counts.pages);
            return Some(TerminationReason::PageLimit);
        }
        if harvest.max_idle_rounds.is_some_and(|max| run.idle_rounds >= max) {
            log::info!("Idle limit of {} round(s) reached", run.idle_rounds);
            return Some(TerminationReason::IdleLimit);
        }
        None
    }

    /// Walk the recovery strategies in order until one succeeds.
    /// Nudging always succeeds, so a recovery round never aborts the run.
    async fn recover(&mut self, run: &mut RunState) -> Result<RecoveryStrategy> {
        self.enter(HarvestState::Recovering);
        run.counts.recoveries += 1;

        for strategy in RecoveryStrategy::ORDER {
            let outcome = match strategy {
                RecoveryStrategy::SoftRefetch => self.soft_refetch(run).await,
                RecoveryStrategy::ReloadAndRediscover => self.reload_and_rediscover(run).await,
                RecoveryStrategy::NudgeAndContinue => {
                    if let Err(e) = self.transport.nudge().await {
                        log::warn!("Nudge failed: {}", e);
                    }
                    run.idle_rounds += 1;
                    Ok(true)
                }
            };
            match outcome {
                Ok(true) => {
                    log::info!("Recovered by {}", strategy);
                    run.stall.reset();
                    return Ok(strategy);
                }
                Ok(false) => log::warn!("{} found no usable cursor", strategy),
                Err(e) if e.is_transport() || matches!(e, AppError::Parse(_)) => {
                    log::warn!("{} failed: {}", strategy, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(RecoveryStrategy::NudgeAndContinue)
    }

    async fn soft_refetch(&mut self, run: &mut RunState) -> Result<bool> {
        let request = self.templates.build_next_request(&run.template, None)?;
        self.pace().await;
        let body = self.transport.replay(&request).await?;
        self.adopt_recovered(run, &body).await
    }

    async fn reload_and_rediscover(&mut self, run: &mut RunState) -> Result<bool> {
        self.transport.reload_origin().await?;
        let (fresh, captured) = self.discover().await?;
        if fresh.identity == run.template.identity {
            self.templates.absorb_capture(&mut run.template, &fresh);
        } else {
            log::warn!(
                "Query changed from {} to {} after reload",
                run.template.identity,
                fresh.identity
            );
            self.templates.refresh(fresh.variables.clone());
            run.template = fresh;
        }

        let cursor = captured
            .filter(|c| run.usable(c))
            .or_else(|| run.cursor.clone());
        let request = self
            .templates
            .build_next_request(&run.template, cursor.as_deref())?;
        self.pace().await;
        let body = self.transport.replay(&request).await?;
        self.adopt_recovered(run, &body).await
    }

    /// Sink a recovery page and follow its cursor when it is usable.
    async fn adopt_recovered(&mut self, run: &mut RunState, body: &str) -> Result<bool> {
        let extraction = self.extractor.extract(body)?;
        let Some(next) = extraction.continuation().map(str::to_string) else {
            return Ok(false);
        };
        if !run.usable(&next) {
            return Ok(false);
        }

        let new_records = run.append(extraction.records).await?;
        run.counts.records_written += new_records;
        run.enqueue(extraction.expansion_jobs);
        run.advance(next);
        self.commit(run).await?;
        log::info!(
            "Recovery page gave {} new record(s), continuing at {}",
            new_records,
            preview(run.cursor.as_deref())
        );
        Ok(true)
    }

    /// Persist the resume point. Always runs after the sink append.
    async fn commit(&self, run: &mut RunState) -> Result<()> {
        let checkpoint = &mut run.checkpoint;
        checkpoint.cursor = run.cursor.clone();
        checkpoint.vars_template = Some(self.templates.resolved(&run.template)?);
        checkpoint.cursor_key = run.template.cursor_key.clone();
        checkpoint.query_identity = Some(run.template.identity.clone());
        checkpoint.dedup_keys = run.index.to_sorted();
        self.checkpoints.save(checkpoint).await
    }

    /// Drain every queued reply thread, breadth-first, before the next page.
    async fn drain_expansions(&mut self, run: &mut RunState) -> Result<()> {
        if run.queue.is_empty() {
            return Ok(());
        }
        if !self.templates.expansion_enabled() {
            let dropped = run.queue.clear();
            log::warn!(
                "Dropped {} reply thread(s): no [expansion] query configured",
                dropped
            );
            return Ok(());
        }

        self.enter(HarvestState::DrainingExpansions);
        while let Some(job) = run.queue.pop() {
            if self.drain_job(run, &job).await? {
                run.counts.expansions_drained += 1;
            } else {
                run.counts.expansions_abandoned += 1;
            }
        }
        Ok(())
    }

    /// Page through one reply thread until its token is absent or repeats.
    /// Transport and parse failures abandon the thread, not the run; the
    /// return value is `false` in that case.
    async fn drain_job(&mut self, run: &mut RunState, job: &ExpansionJob) -> Result<bool> {
        let mut token = job.continuation_token.clone();
        let mut seen: HashSet<String> = token.iter().cloned().collect();
        let mut round = 0usize;

        loop {
            round += 1;
            let request = self.templates.build_expansion_request(
                &run.template,
                &job.parent_id,
                token.as_deref(),
            )?;
            self.pace().await;

            let body = match self.transport.replay(&request).await {
                Ok(body) => body,
                Err(e) if e.is_transport() => {
                    log::warn!("Reply thread {} abandoned: {}", job.parent_id, e);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            let extraction = match self.extractor.extract(&body) {
                Ok(extraction) => extraction,
                Err(AppError::Parse(message)) => {
                    log::error!("Replies of {} unparseable: {}", job.parent_id, message);
                    let label = format!("replies-{}-{round:03}", file_safe(&job.parent_id));
                    self.dumps.dump(&label, &body).await;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            let next = extraction.continuation().map(str::to_string);
            let replies: Vec<Record> = extraction
                .records
                .into_iter()
                .filter(|r| r.parent_key() != job.parent_id)
                .map(|mut r| {
                    r.parent_id.get_or_insert_with(|| job.parent_id.clone());
                    r
                })
                .collect();
            let new_replies = run.append(replies).await?;
            run.counts.replies_written += new_replies;
            run.enqueue(extraction.expansion_jobs);
            log::debug!(
                "Replies of {} (round {}): {} new",
                job.parent_id,
                round,
                new_replies
            );

            match next {
                Some(next) if seen.insert(next.clone()) => token = Some(next),
                Some(_) => {
                    log::info!("Reply token of {} repeated, thread closed", job.parent_id);
                    return Ok(true);
                }
                None => return Ok(true),
            }
        }
    }

    async fn pace(&self) {
        pause(self.config.harvest.jitter_min_ms, self.config.harvest.jitter_max_ms).await;
    }

    async fn write_summary(&self, summary: &RunSummary) {
        let path: PathBuf = self.config.paths.summary.clone();
        if let Err(e) = LocalStorage::new(PathBuf::new()).write_json(&path, summary).await {
            log::warn!("Could not write run summary to {}: {}", path.display(), e);
        }
    }
}

/// Short form of a cursor for log lines.
fn preview(cursor: Option<&str>) -> String {
    match cursor {
        None => "<none>".to_string(),
        Some(c) if c.chars().count() <= 16 => c.to_string(),
        Some(c) => format!("{}...", c.chars().take(16).collect::<String>()),
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DOC_ID_PARAM, ExpansionConfig, RequestDescriptor};
    use crate::transport::scripted::{ScriptedTransport, capture, feed_page};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.target.id = "group-42".into();
        config.paths.output_log = dir.join("records.jsonl");
        config.paths.checkpoint = dir.join("checkpoint.json");
        config.paths.dump_dir = dir.join("failures");
        config.paths.summary = dir.join("last_run.json");
        config.harvest.jitter_min_ms = 0;
        config.harvest.jitter_max_ms = 0;
        config
    }

    fn feed_capture() -> RequestDescriptor {
        capture(json!({"id": "42", "count": 10, "cursor": null}))
    }

    fn logged(config: &Config) -> Vec<Value> {
        std::fs::read_to_string(&config.paths.output_log)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn logged_ids(config: &Config) -> Vec<String> {
        logged(config)
            .iter()
            .map(|r| r["resource_id"].as_str().unwrap().to_string())
            .collect()
    }

    async fn checkpoint(config: &Config) -> Checkpoint {
        CheckpointStore::new(config.paths.checkpoint.clone())
            .load()
            .await
            .unwrap()
            .unwrap()
    }

    fn three_page_script() -> ScriptedTransport {
        ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1", "2", "3"], Some("X1")))
            .reply(feed_page(&["2", "4"], Some("X2")))
            .reply(feed_page(&[], None))
    }

    #[tokio::test]
    async fn test_three_pages_until_exhausted() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());

        let mut harvester = Harvester::new(cfg.clone(), three_page_script());
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.pages, 3);
        assert_eq!(summary.counts.records_written, 4);
        assert_eq!(summary.counts.duplicates, 1);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "4"]);

        let transport = harvester.transport();
        assert_eq!(transport.requests.len(), 3);
        assert_eq!(transport.sent_variable(0, "cursor"), None);
        assert_eq!(transport.sent_variable(1, "cursor"), Some(json!("X1")));
        assert_eq!(transport.sent_variable(2, "cursor"), Some(json!("X2")));

        let cp = checkpoint(&cfg).await;
        assert!(cp.cursor.is_none());
        assert_eq!(cp.dedup_keys.len(), 4);
        assert_eq!(cp.pages_committed, 3);
        assert!(!cp.vars_template.unwrap().variables.contains_key("cursor"));

        assert_eq!(
            harvester.history().last(),
            Some(&HarvestState::Done(TerminationReason::Exhausted))
        );
        assert!(cfg.paths.summary.exists());
    }

    #[tokio::test]
    async fn test_second_run_sinks_nothing() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());

        Harvester::new(cfg.clone(), three_page_script())
            .run()
            .await
            .unwrap();
        let summary = Harvester::new(cfg.clone(), three_page_script())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.counts.records_written, 0);
        assert_eq!(summary.counts.duplicates, 5);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_non_advancing_cursor_stops_without_fourth_fetch() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1", "2"], Some("X1")))
            .reply(feed_page(&["3"], Some("X2")))
            .reply(feed_page(&["4"], Some("X2")))
            .reply(feed_page(&["5"], Some("X3")));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::CursorNotAdvancing);
        assert!(summary.reason.is_fuse());
        assert_eq!(harvester.transport().requests.len(), 3);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "4"]);
        assert_eq!(checkpoint(&cfg).await.cursor.as_deref(), Some("X2"));
    }

    #[tokio::test]
    async fn test_repeated_cursor_stops() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1"], Some("X1")))
            .reply(feed_page(&["2"], Some("X2")))
            .reply(feed_page(&["3"], Some("X1")));

        let summary = Harvester::new(cfg.clone(), transport).run().await.unwrap();
        assert_eq!(summary.reason, TerminationReason::CursorRepeated);
        assert_eq!(summary.counts.pages, 3);
    }

    #[tokio::test]
    async fn test_resume_uses_checkpoint_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.max_pages = Some(1);

        let first = Harvester::new(cfg.clone(), three_page_script())
            .run()
            .await
            .unwrap();
        assert_eq!(first.reason, TerminationReason::PageLimit);
        assert_eq!(checkpoint(&cfg).await.cursor.as_deref(), Some("X1"));

        cfg.harvest.max_pages = None;
        let transport = ScriptedTransport::new(capture(
            json!({"id": "42", "count": 10, "cursor": "FRESH"}),
        ))
        .reply(feed_page(&["2", "4"], Some("X2")))
        .reply(feed_page(&[], None));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.records_written, 1);
        assert_eq!(harvester.transport().discoveries, 0);
        assert_eq!(
            harvester.transport().sent_variable(0, "cursor"),
            Some(json!("X1"))
        );
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "4"]);
        assert_eq!(checkpoint(&cfg).await.pages_committed, 3);
    }

    #[tokio::test]
    async fn test_fresh_start_ignores_stored_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.max_pages = Some(1);
        Harvester::new(cfg.clone(), three_page_script())
            .run()
            .await
            .unwrap();

        cfg.harvest.max_pages = None;
        let mut harvester = Harvester::new(cfg.clone(), three_page_script()).fresh_start(true);
        let summary = harvester.run().await.unwrap();

        assert_eq!(harvester.transport().discoveries, 1);
        assert_eq!(harvester.transport().sent_variable(0, "cursor"), None);
        assert_eq!(summary.counts.records_written, 1);
    }

    fn other_query_capture() -> RequestDescriptor {
        let mut descriptor = feed_capture();
        descriptor
            .form
            .insert(DOC_ID_PARAM.to_string(), "6001".to_string());
        descriptor
    }

    async fn checkpoint_at_x1(cfg: &Config) {
        let mut cfg = cfg.clone();
        cfg.harvest.max_pages = Some(1);
        Harvester::new(cfg, three_page_script()).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_mismatch_trusts_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        checkpoint_at_x1(&cfg).await;

        cfg.harvest.verify_identity = true;
        let transport = ScriptedTransport::new(other_query_capture()).reply(feed_page(&[], None));
        let mut harvester = Harvester::new(cfg.clone(), transport);
        harvester.run().await.unwrap();

        let sent = &harvester.transport().requests[0];
        assert_eq!(sent.identity.doc_id, "6001");
        assert_eq!(sent.variables["cursor"], json!("X1"));
        assert_eq!(
            checkpoint(&cfg).await.query_identity.unwrap().doc_id,
            "6001"
        );
    }

    #[tokio::test]
    async fn test_identity_mismatch_discards_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        checkpoint_at_x1(&cfg).await;

        cfg.harvest.verify_identity = true;
        cfg.harvest.identity_mismatch = IdentityMismatch::DiscardCursor;
        let transport = ScriptedTransport::new(other_query_capture()).reply(feed_page(&[], None));
        let mut harvester = Harvester::new(cfg.clone(), transport);
        harvester.run().await.unwrap();

        assert_eq!(harvester.transport().sent_variable(0, "cursor"), None);
    }

    #[tokio::test]
    async fn test_stall_recovered_by_soft_refetch() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1", "2", "3"], Some("X1")))
            .reply(feed_page(&["1", "2"], Some("X2")))
            .reply(feed_page(&["2"], Some("X3")))
            .reply(feed_page(&["3"], Some("X4")))
            .reply(feed_page(&["5", "6"], Some("Y1")))
            .reply(feed_page(&["7"], None));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.recoveries, 1);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "5", "6", "7"]);

        let transport = harvester.transport();
        assert_eq!(transport.reloads, 0);
        assert_eq!(transport.sent_variable(4, "cursor"), None);
        assert_eq!(transport.sent_variable(5, "cursor"), Some(json!("Y1")));

        let history = harvester.history();
        let stalled = history
            .iter()
            .position(|s| *s == HarvestState::Stalled)
            .unwrap();
        assert_eq!(history[stalled + 1], HarvestState::Recovering);
        assert_eq!(history[stalled + 2], HarvestState::Paging);
    }

    fn recaptured(av: &str, doc_id: &str, variables: Value) -> RequestDescriptor {
        let mut descriptor = capture(variables);
        descriptor.form.insert("av".to_string(), av.to_string());
        descriptor
            .form
            .insert(DOC_ID_PARAM.to_string(), doc_id.to_string());
        descriptor
    }

    /// Stalls after page 3; the soft refetch only offers the used cursor X1,
    /// so recovery falls through to a reload that serves `after_reload`.
    fn stall_into_reload(after_reload: RequestDescriptor) -> ScriptedTransport {
        ScriptedTransport::new(feed_capture())
            .then_capture(after_reload)
            .reply(feed_page(&["1", "2"], Some("X1")))
            .reply(feed_page(&["1"], Some("X2")))
            .reply(feed_page(&["2"], Some("X3")))
            .reply(feed_page(&["1"], Some("X1")))
            .reply(feed_page(&["5"], Some("Y1")))
            .reply(feed_page(&["6"], None))
    }

    #[tokio::test]
    async fn test_reload_adopts_fresh_session_params() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.no_progress_limit = 2;
        let after_reload = recaptured(
            "2000",
            "5001",
            json!({"id": "42", "count": 10, "scale": 2, "cursor": null}),
        );

        let mut harvester = Harvester::new(cfg.clone(), stall_into_reload(after_reload));
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.recoveries, 1);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "5", "6"]);

        let transport = harvester.transport();
        assert_eq!(transport.reloads, 1);
        assert_eq!(transport.requests.len(), 6);
        assert_eq!(transport.requests[2].params["av"], "1000");
        assert_eq!(transport.sent_variable(3, "cursor"), None);
        for n in [4, 5] {
            let sent = &transport.requests[n];
            assert_eq!(sent.params["av"], "2000");
            assert_eq!(sent.identity.doc_id, "5001");
            assert_eq!(sent.variables["scale"], json!(2));
        }
        assert_eq!(transport.sent_variable(4, "cursor"), Some(json!("X3")));
        assert_eq!(transport.sent_variable(5, "cursor"), Some(json!("Y1")));

        let stored = checkpoint(&cfg).await.vars_template.unwrap();
        assert_eq!(stored.params["av"], "2000");
        assert_eq!(stored.variables["scale"], json!(2));
        assert!(!stored.variables.contains_key("cursor"));
    }

    #[tokio::test]
    async fn test_reload_follows_changed_query_and_its_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.no_progress_limit = 2;
        let after_reload = recaptured(
            "1000",
            "6001",
            json!({"id": "42", "count": 10, "cursor": "C9"}),
        );

        let mut harvester = Harvester::new(cfg.clone(), stall_into_reload(after_reload));
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);

        let transport = harvester.transport();
        assert_eq!(transport.requests[3].identity.doc_id, "5001");
        assert_eq!(transport.requests[4].identity.doc_id, "6001");
        assert_eq!(transport.sent_variable(4, "cursor"), Some(json!("C9")));
        assert_eq!(transport.requests[5].identity.doc_id, "6001");
        assert_eq!(transport.sent_variable(5, "cursor"), Some(json!("Y1")));

        let cp = checkpoint(&cfg).await;
        assert_eq!(cp.query_identity.unwrap().doc_id, "6001");
        assert!(cp.cursor.is_none());
        let stored = cp.vars_template.unwrap();
        assert_eq!(stored.identity.doc_id, "6001");
        assert!(!stored.variables.contains_key("cursor"));
    }

    #[tokio::test]
    async fn test_transport_failures_then_success() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture())
            .fail(2)
            .reply(feed_page(&["1", "2", "3"], Some("X1")))
            .reply(feed_page(&["2", "4"], Some("X2")))
            .reply(feed_page(&[], None));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.recoveries, 1);
        assert_eq!(harvester.transport().reloads, 1);
        assert_eq!(logged_ids(&cfg), vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_transport_failures_exhaust_budget() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.max_recovery_attempts = 2;
        let transport = ScriptedTransport::new(feed_capture()).fail(20);

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let err = harvester.run().await.unwrap_err();

        assert!(matches!(err, AppError::RecoveryExhausted { attempts: 3, .. }));
        assert_eq!(harvester.transport().nudges, 2);
        assert!(logged_ids(&cfg).is_empty());
    }

    #[tokio::test]
    async fn test_idle_limit_after_nudge() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.harvest.no_progress_limit = 1;
        cfg.harvest.max_idle_rounds = Some(1);
        let transport = ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1"], Some("X1")))
            .reply(feed_page(&["1"], Some("X2")))
            .reply(feed_page(&["1"], Some("X2")))
            .reply(feed_page(&["1"], Some("X1")));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::IdleLimit);
        assert_eq!(harvester.transport().requests.len(), 4);
        assert_eq!(harvester.transport().nudges, 1);
        assert_eq!(checkpoint(&cfg).await.cursor.as_deref(), Some("X2"));
    }

    #[tokio::test]
    async fn test_parse_failure_dumps_body_and_stops() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture())
            .reply(feed_page(&["1"], Some("X1")))
            .reply("<<<not json>>>");

        let summary = Harvester::new(cfg.clone(), transport).run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::ParseFailure);
        let dump = cfg.paths.dump_dir.join("page-00002.txt");
        assert_eq!(std::fs::read_to_string(dump).unwrap(), "<<<not json>>>");
        assert_eq!(checkpoint(&cfg).await.cursor.as_deref(), Some("X1"));
    }

    fn page_with_thread() -> String {
        json!({"data": {"node": {"group_feed": {"edges": [
            {"node": {"__typename": "Story", "post_id": "100"}},
            {"node": {
                "__typename": "Comment",
                "comment_id": "200",
                "feedback": {"total_reply_count": 3, "expansion_token": "T0"}
            }}
        ]}}}})
        .to_string()
    }

    fn replies(ids: &[&str], token: Option<&str>) -> String {
        let edges: Vec<Value> = ids
            .iter()
            .map(|id| json!({"node": {"__typename": "Comment", "comment_id": id}}))
            .collect();
        json!({"data": {"replies": {
            "edges": edges,
            "page_info": {"end_cursor": token, "has_next_page": token.is_some()}
        }}})
        .to_string()
    }

    #[tokio::test]
    async fn test_reply_threads_drained() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.expansion = ExpansionConfig {
            doc_id: Some("777".into()),
            friendly_name: "CommentRepliesQuery".into(),
            parent_key: "commentID".into(),
            token_key: "expansionToken".into(),
            variables: serde_json::Map::new(),
        };
        let transport = ScriptedTransport::new(feed_capture())
            .reply(page_with_thread())
            .reply(replies(&["201", "202"], Some("T1")))
            .reply(replies(&["203"], None));

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.replies_written, 3);
        assert_eq!(summary.counts.expansions_drained, 1);
        assert_eq!(logged_ids(&cfg), vec!["100", "200", "201", "202", "203"]);
        assert_eq!(logged(&cfg)[2]["parent_id"], json!("200"));

        let transport = harvester.transport();
        assert_eq!(transport.requests[1].identity.doc_id, "777");
        assert_eq!(transport.sent_variable(1, "commentID"), Some(json!("200")));
        assert_eq!(transport.sent_variable(1, "expansionToken"), Some(json!("T0")));
        assert_eq!(transport.sent_variable(2, "expansionToken"), Some(json!("T1")));
        assert!(
            harvester
                .history()
                .contains(&HarvestState::DrainingExpansions)
        );
    }

    #[tokio::test]
    async fn test_failed_reply_thread_counted_as_abandoned() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.expansion = ExpansionConfig {
            doc_id: Some("777".into()),
            friendly_name: "CommentRepliesQuery".into(),
            parent_key: "commentID".into(),
            token_key: "expansionToken".into(),
            variables: serde_json::Map::new(),
        };
        let transport = ScriptedTransport::new(feed_capture())
            .reply(page_with_thread())
            .fail(1);

        let summary = Harvester::new(cfg.clone(), transport).run().await.unwrap();

        assert_eq!(summary.reason, TerminationReason::Exhausted);
        assert_eq!(summary.counts.expansions_drained, 0);
        assert_eq!(summary.counts.expansions_abandoned, 1);
        assert_eq!(logged_ids(&cfg), vec!["100", "200"]);
    }

    #[tokio::test]
    async fn test_reply_threads_dropped_without_query() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let transport = ScriptedTransport::new(feed_capture()).reply(page_with_thread());

        let mut harvester = Harvester::new(cfg.clone(), transport);
        let summary = harvester.run().await.unwrap();

        assert_eq!(summary.counts.expansions_drained, 0);
        assert_eq!(harvester.transport().requests.len(), 1);
        assert_eq!(logged_ids(&cfg), vec!["100", "200"]);
    }

    #[test]
    fn test_cursor_preview() {
        assert_eq!(preview(None), "<none>");
        assert_eq!(preview(Some("X1")), "X1");
        assert_eq!(preview(Some("ABCDEFGHIJKLMNOPQRSTUV")), "ABCDEFGHIJKLMNOP...");
    }
}
