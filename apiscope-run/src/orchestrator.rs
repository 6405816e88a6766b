//! Single-run lifecycle state machine.
//!
//! ```text
//! INIT → LAUNCH → NAVIGATE → (INTERSTITIAL?) → WAIT_TARGET_HOST → WAIT_IDLE
//!      → (FLOW?) → CAPTURE_WINDOW → DRAIN → CLOSE → AGGREGATE → DONE
//! ```
//!
//! A global deadline (skipped in watch mode) can cut any stage short; the
//! run then still drains, closes the browser, and aggregates whatever landed
//! in the journal. Launch and navigation failures are fatal; interstitial,
//! host-reach, idle, and flow failures are logged and the run continues.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use apiscope_capture::{
    new_run_id, CaptureLog, CapturePipeline, ConcurrencyLimiter, RunMetadata,
};
use apiscope_capture::redact::redact_error;
use apiscope_common::{ConsentMode, ScopeError};
use apiscope_config::RunOptions;
use apiscope_session::{
    BrowserContext, BrowserPage, BrowserResponse, BrowserSession, FlowScript, InterstitialHandler,
    LoadState, SessionLauncher, SessionOptions, UrlPredicate,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::aggregate_run;
use crate::score::{score_endpoints, BodyEvidenceSpec, ScoringWeights};
use crate::summary::{write_summary, RunSummary, SUMMARY_TOP_ENDPOINTS};

const WAIT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const HOST_REACH_TIMEOUT: Duration = Duration::from_secs(10);
const INTERSTITIAL_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub summary: Option<RunSummary>,
    pub total_responses: u64,
    pub persisted: u64,
    pub duplicates_skipped: u64,
}

/// Drives one capture run against a browser session.
pub struct RunOrchestrator {
    opts: RunOptions,
    launcher: Arc<dyn SessionLauncher>,
    handlers: Vec<Arc<dyn InterstitialHandler>>,
    flow: Option<Arc<dyn FlowScript>>,
}

impl RunOrchestrator {
    pub fn new(opts: RunOptions, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            opts,
            launcher,
            handlers: Vec::new(),
            flow: None,
        }
    }

    pub fn with_interstitial_handlers(
        mut self,
        handlers: Vec<Arc<dyn InterstitialHandler>>,
    ) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_flow(mut self, flow: Arc<dyn FlowScript>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Execute the run to completion. Configuration errors surface before
    /// any run directory exists; launch/navigation failures surface after
    /// CLOSE and AGGREGATE so partial captures stay usable.
    pub async fn run(self) -> Result<RunReport, ScopeError> {
        self.opts.validate()?;
        let limiter = Arc::new(ConcurrencyLimiter::new(self.opts.max_concurrent_captures)?);

        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            started_at,
            url: self.opts.url.clone(),
            options: self.opts.clone(),
        };
        let journal = Arc::new(
            CaptureLog::create(&self.opts.out_dir, &metadata)
                .await
                .map_err(|e| ScopeError::Storage(e.to_string()))?,
        );
        let run_dir = journal.run_dir().to_path_buf();
        let pipeline = Arc::new(CapturePipeline::create(&self.opts, journal).await?);

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let deadline_task = if self.opts.watch {
            None
        } else {
            let token = cancel.clone();
            let limit = Duration::from_millis(self.opts.timeout_ms);
            Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("run.deadline.expired");
                token.cancel();
            }))
        };

        let mut session: Option<Arc<dyn BrowserSession>> = None;
        let mut context: Option<Arc<dyn BrowserContext>> = None;
        let mut forwarder: Option<JoinHandle<()>> = None;

        let fatal = match self
            .drive(
                &run_id, &cancel, &limiter, &pipeline, &run_dir, &mut session, &mut context,
                &mut forwarder,
            )
            .await
        {
            Ok(DriveEnd::Completed) => None,
            // Deadline expiry is cooperative cancellation, not failure: the
            // run still drains, closes, aggregates, and reaches DONE.
            Ok(DriveEnd::DeadlineHit) => {
                warn!(run_id = %run_id, "run.deadline.cut_short");
                None
            }
            Err(reason) => {
                tracing::error!(run_id = %run_id, reason = %reason, "run.fatal");
                Some(reason)
            }
        };

        // Window over: responses arriving from here on are dropped silently.
        pipeline.close_window();

        self.stage(&run_id, "drain");
        let remaining = Duration::from_millis(self.opts.timeout_ms).saturating_sub(started.elapsed());
        let drain_budget = remaining.max(MIN_DRAIN_TIMEOUT);
        if tokio::time::timeout(drain_budget, limiter.drain())
            .await
            .is_err()
        {
            warn!(
                run_id = %run_id,
                pending = limiter.pending(),
                running = limiter.running(),
                "run.drain.abandoned"
            );
        }
        if let Some(task) = forwarder {
            task.abort();
        }

        self.stage(&run_id, "close");
        self.close_session(&run_dir, &session, &context).await;
        if let Some(task) = deadline_task {
            task.abort();
        }

        let summary = if self.opts.disable_summary {
            None
        } else {
            self.stage(&run_id, "aggregate");
            match self
                .aggregate(&run_id, started_at, &run_dir, &pipeline)
                .await
            {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "run.aggregate.failed");
                    None
                }
            }
        };

        self.stage(&run_id, "done");
        let report = RunReport {
            run_id,
            run_dir,
            summary,
            total_responses: pipeline.total_responses(),
            persisted: pipeline.persisted(),
            duplicates_skipped: pipeline.duplicates(),
        };

        match fatal {
            None => Ok(report),
            Some(reason) => Err(ScopeError::Session(anyhow::anyhow!(
                "run {} failed: {reason} (partial capture in {})",
                report.run_id,
                report.run_dir.display()
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
        limiter: &Arc<ConcurrencyLimiter>,
        pipeline: &Arc<CapturePipeline>,
        run_dir: &Path,
        session_slot: &mut Option<Arc<dyn BrowserSession>>,
        context_slot: &mut Option<Arc<dyn BrowserContext>>,
        forwarder_slot: &mut Option<JoinHandle<()>>,
    ) -> Result<DriveEnd, String> {
        let ceiling = Duration::from_millis(self.opts.timeout_ms);

        self.stage(run_id, "launch");
        let session_opts = self.session_options(run_dir);
        let session = match bounded(cancel, ceiling, self.launcher.launch(&session_opts)).await {
            Ok(session) => session,
            Err(StageFailure::Deadline) => return Ok(DriveEnd::DeadlineHit),
            Err(e) => return Err(format!("browser launch failed: {e}")),
        };
        *session_slot = Some(session.clone());

        let context = match bounded(cancel, ceiling, session.new_context(&session_opts)).await {
            Ok(context) => context,
            Err(StageFailure::Deadline) => return Ok(DriveEnd::DeadlineHit),
            Err(e) => return Err(format!("context creation failed: {e}")),
        };
        *context_slot = Some(context.clone());
        if self.opts.trace {
            match context.start_tracing().await {
                Ok(true) => debug!("run.trace.started"),
                Ok(false) => debug!("run.trace.unsupported"),
                Err(e) => debug!(error = %e, "run.trace.start_failed"),
            }
        }

        let page = match bounded(cancel, ceiling, context.new_page()).await {
            Ok(page) => page,
            Err(StageFailure::Deadline) => return Ok(DriveEnd::DeadlineHit),
            Err(e) => return Err(format!("page creation failed: {e}")),
        };

        // The response hook only enqueues; workers do the heavy lifting off
        // the engine's event path.
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<dyn BrowserResponse>>();
        page.on_response(tx);
        {
            let limiter = limiter.clone();
            let pipeline = pipeline.clone();
            *forwarder_slot = Some(tokio::spawn(async move {
                while let Some(response) = rx.recv().await {
                    if pipeline.is_closing() {
                        continue;
                    }
                    let pipeline = pipeline.clone();
                    // Outcomes land in the pipeline counters; the handle can go.
                    let _ = limiter.submit(async move { pipeline.process(response).await });
                }
            }));
        }

        self.stage(run_id, "navigate");
        match bounded(
            cancel,
            ceiling,
            page.goto(&self.opts.url, LoadState::DomContentLoaded, ceiling),
        )
        .await
        {
            Ok(()) => {}
            Err(StageFailure::Deadline) => return Ok(DriveEnd::DeadlineHit),
            Err(e) => return Err(format!("navigation failed: {e}")),
        }

        if self.opts.consent_mode != ConsentMode::Off && !self.handlers.is_empty() {
            self.stage(run_id, "interstitial");
            self.dismiss_interstitials(cancel, &page).await;
        }

        self.stage(run_id, "wait_target_host");
        self.wait_for_target_host(cancel, &page).await;

        self.stage(run_id, "wait_idle");
        if let Err(e) = bounded(
            cancel,
            WAIT_IDLE_TIMEOUT,
            page.wait_for_load_state(LoadState::NetworkIdle, WAIT_IDLE_TIMEOUT),
        )
        .await
        {
            debug!(error = %e, "run.wait_idle.gave_up");
        }

        if let Some(flow) = &self.flow {
            self.stage(run_id, "flow");
            if let Err(e) = bounded(cancel, ceiling, flow.run(page.clone())).await {
                warn!(error = %e, "run.flow.failed");
            }
        }

        self.stage(run_id, "capture_window");
        let window = tokio::time::sleep(Duration::from_millis(self.opts.monitor_ms));
        tokio::pin!(window);
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
        progress.tick().await;
        loop {
            tokio::select! {
                _ = &mut window => break,
                _ = cancel.cancelled() => {
                    debug!("run.capture_window.cut_short");
                    break;
                }
                _ = progress.tick() => {
                    info!(
                        persisted = pipeline.persisted(),
                        duplicates = pipeline.duplicates(),
                        running = limiter.running(),
                        pending = limiter.pending(),
                        "run.capture.progress"
                    );
                }
            }
        }
        Ok(DriveEnd::Completed)
    }

    /// Try every selected handler against every frame; stop at the first
    /// dismissal and let the page settle. All failures are best-effort.
    async fn dismiss_interstitials(&self, cancel: &CancellationToken, page: &Arc<dyn BrowserPage>) {
        let frames = page.frames().await;
        for frame in &frames {
            for handler in &self.handlers {
                if cancel.is_cancelled() {
                    return;
                }
                if !self.handler_selected(handler.name()) {
                    continue;
                }
                if !handler.matches(frame.as_ref()).await {
                    continue;
                }
                match handler
                    .dismiss(frame.as_ref(), self.opts.consent_action, INTERSTITIAL_TIMEOUT)
                    .await
                {
                    Ok(true) => {
                        info!(handler = handler.name(), "run.interstitial.dismissed");
                        let _ = page
                            .wait_for_load_state(LoadState::DomContentLoaded, INTERSTITIAL_TIMEOUT)
                            .await;
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(handler = handler.name(), error = %e, "run.interstitial.handler_failed");
                    }
                }
            }
        }
    }

    fn handler_selected(&self, name: &str) -> bool {
        match self.opts.consent_mode {
            ConsentMode::Off => false,
            ConsentMode::Yahoo => name == "yahoo",
            ConsentMode::Generic => name == "generic",
            ConsentMode::Auto => {
                self.opts.consent_handlers.is_empty()
                    || self.opts.consent_handlers.iter().any(|h| h == name)
            }
        }
    }

    async fn wait_for_target_host(&self, cancel: &CancellationToken, page: &Arc<dyn BrowserPage>) {
        let Some(host) = url::Url::parse(&self.opts.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
        else {
            return;
        };
        let predicate: UrlPredicate = Arc::new(move |current: &str| {
            url::Url::parse(current)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned))
                .is_some_and(|h| h == host)
        });
        if let Err(e) = bounded(
            cancel,
            HOST_REACH_TIMEOUT,
            page.wait_for_url(predicate, HOST_REACH_TIMEOUT),
        )
        .await
        {
            warn!(error = %e, "run.wait_target_host.gave_up");
        }
    }

    fn session_options(&self, run_dir: &Path) -> SessionOptions {
        SessionOptions {
            user_agent: self.opts.user_agent.clone(),
            storage_state: self.opts.storage_state.clone(),
            record_har: self.opts.save_har.then(|| run_dir.join("session.har")),
            trace: self.opts.trace,
        }
    }

    async fn close_session(
        &self,
        run_dir: &Path,
        session: &Option<Arc<dyn BrowserSession>>,
        context: &Option<Arc<dyn BrowserContext>>,
    ) {
        if let Some(context) = context {
            let save_path = self
                .opts
                .save_storage_state
                .clone()
                .or_else(|| self.opts.save_session.clone());
            if let Some(path) = save_path {
                if let Err(e) = context.storage_state(&path).await {
                    warn!(error = %e, "run.storage_state.save_failed");
                }
            }
            if self.opts.trace {
                if let Err(e) = context.stop_tracing(&run_dir.join("trace.zip")).await {
                    debug!(error = %e, "run.trace.stop_failed");
                }
            }
        }
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                warn!(error = %e, "run.close.failed");
            }
        }
    }

    async fn aggregate(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        run_dir: &Path,
        pipeline: &CapturePipeline,
    ) -> anyhow::Result<RunSummary> {
        let (aggregates, records) = aggregate_run(run_dir).await?;
        let scored = if records == 0 {
            Vec::new()
        } else {
            score_endpoints(aggregates, records)
        };

        let summary = RunSummary {
            run_id: run_id.to_string(),
            url: self.opts.url.clone(),
            started_at,
            completed_at: Utc::now(),
            capture_dir: run_dir.display().to_string(),
            total_responses: pipeline.total_responses(),
            json_captures: records,
            duplicates_skipped: pipeline.duplicates(),
            total_endpoints: scored.len() as u64,
            scoring_weights: ScoringWeights::default(),
            body_evidence: BodyEvidenceSpec::default(),
            endpoints: scored.iter().take(SUMMARY_TOP_ENDPOINTS).cloned().collect(),
        };
        write_summary(run_dir, &summary, &scored).await?;
        info!(
            run_id = %run_id,
            endpoints = summary.total_endpoints,
            captures = summary.json_captures,
            "run.summary.written"
        );
        Ok(summary)
    }

    fn stage(&self, run_id: &str, name: &'static str) {
        info!(run_id = %run_id, stage = name, "run.stage");
    }
}

/// How the driven portion of the run ended.
enum DriveEnd {
    Completed,
    /// The global deadline fired mid-stage; proceed straight to DRAIN.
    DeadlineHit,
}

/// Why a bounded stage did not produce a value.
#[derive(Debug)]
enum StageFailure {
    /// The run-wide deadline fired.
    Deadline,
    /// The stage's own ceiling elapsed.
    TimedOut,
    Failed(String),
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadline => write!(f, "run deadline expired"),
            Self::TimedOut => write!(f, "stage timed out"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

/// Race a stage against both the global deadline and its own ceiling.
async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T, StageFailure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StageFailure::Deadline),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StageFailure::Failed(redact_error(&e.to_string()))),
            Err(_) => Err(StageFailure::TimedOut),
        },
    }
}
