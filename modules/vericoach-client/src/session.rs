//! Run session controller.
//!
//! Owns the lifecycle of one verification run: start over HTTP, follow on
//! the live channel, backstop with status polling, merge everything
//! monotonically, expose cancel. Only one channel and one poll loop exist
//! at a time, scoped to the active run id; starting a new run tears both
//! down before anything else happens, so two runs' events can never
//! cross-talk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use vericoach_common::config::DeploymentMode;
use vericoach_common::protocol::{
    CancelResponse, ChannelMessage, ChannelTokenResponse, StartOptions, StartRequest,
    StartResponse, StatusResponse, RunTarget, VerdictResponse,
};
use vericoach_common::types::{RunState, RunStatus};

use crate::channel::{ConnectionStatus, DisconnectReason, EventChannel};
use crate::diag::{DiagnosticEvent, DiagnosticSink};
use crate::error::{ClientError, Result};
use crate::merge::{merge, MergeOutcome, UpdateSource};
use crate::transport::RunApi;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The transport operations the controller needs. A trait so tests can
/// script a backend without HTTP.
#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn start(&self, req: &StartRequest) -> Result<StartResponse>;
    async fn status(&self, run_id: &str) -> Result<StatusResponse>;
    async fn verdict(&self, run_id: &str) -> Result<VerdictResponse>;
    async fn cancel(&self, run_id: &str) -> Result<CancelResponse>;
    async fn channel_token(&self, run_id: &str) -> Result<ChannelTokenResponse>;
}

#[async_trait]
impl RunBackend for RunApi {
    async fn start(&self, req: &StartRequest) -> Result<StartResponse> {
        RunApi::start(self, req).await
    }
    async fn status(&self, run_id: &str) -> Result<StatusResponse> {
        RunApi::status(self, run_id).await
    }
    async fn verdict(&self, run_id: &str) -> Result<VerdictResponse> {
        RunApi::verdict(self, run_id).await
    }
    async fn cancel(&self, run_id: &str) -> Result<CancelResponse> {
        RunApi::cancel(self, run_id).await
    }
    async fn channel_token(&self, run_id: &str) -> Result<ChannelTokenResponse> {
        RunApi::channel_token(self, run_id).await
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Starting,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Latest merged view of the session. Published whole through a watch
/// channel; the UI renders the newest snapshot without tearing down.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub run_id: Option<String>,
    pub run: Option<RunState>,
    pub verdict: Option<VerdictResponse>,
    pub connection: ConnectionStatus,
    /// Message of the failure that made the run terminal, if any.
    pub fatal: Option<String>,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            run_id: None,
            run: None,
            verdict: None,
            connection: ConnectionStatus::disconnected(None),
            fatal: None,
        }
    }
}

/// Ephemeral, toast-style notification. Distinct from the run's persistent
/// status: a failed cancel or start surfaces here and changes nothing else.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StartFailed(String),
    CancelFailed(String),
    Connectivity(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: std::time::Duration,
    /// Consecutive failed polls, with the channel down, before the run is
    /// declared lost.
    pub poll_failure_grace: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(5),
            poll_failure_grace: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct RunSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    backend: Arc<dyn RunBackend>,
    channel: EventChannel,
    config: SessionConfig,
    deployment: DeploymentMode,
    diag: Arc<dyn DiagnosticSink>,
    state: watch::Sender<SessionState>,
    notices: broadcast::Sender<SessionNotice>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RunSession {
    pub fn new(
        backend: Arc<dyn RunBackend>,
        channel: EventChannel,
        config: SessionConfig,
        deployment: DeploymentMode,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::idle());
        let (notices, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(SessionInner {
                backend,
                channel,
                config,
                deployment,
                diag,
                state,
                notices,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Start a brand-new run. Tears down the previous channel and poll
    /// loop and discards all previous run/verdict data first.
    ///
    /// A transport error is fatal to this start attempt (surfaced as a
    /// notice, no retry) and leaves the session idle.
    pub async fn start(
        &self,
        target: RunTarget,
        spec_content: Option<String>,
        spec_path: Option<String>,
        options: StartOptions,
    ) -> Result<String> {
        if target.path().trim().is_empty() {
            let err = ClientError::Invalid("target path is empty".to_string());
            self.inner.notify(SessionNotice::StartFailed(err.to_string()));
            return Err(err);
        }

        let inner = &self.inner;
        inner.teardown().await;
        inner.state.send_replace(SessionState {
            phase: SessionPhase::Starting,
            ..SessionState::idle()
        });

        let req = StartRequest {
            target,
            spec_content,
            spec_path,
            options,
        };
        let resp = match inner.backend.start(&req).await {
            Ok(resp) => resp,
            Err(err) => {
                inner.notify(SessionNotice::StartFailed(err.to_string()));
                inner.state.send_replace(SessionState::idle());
                return Err(err);
            }
        };

        let run_id = resp.run_id.clone();
        let initial = RunState {
            status: resp.status.clone(),
            message: resp.message.clone(),
            started_at: Some(Utc::now()),
            ..RunState::queued()
        };

        if resp.status.is_terminal() {
            // Backend finished before we ever subscribed (e.g. cached result).
            let phase = phase_for(&resp.status);
            let mut initial = initial;
            let fatal = if phase == SessionPhase::Error {
                initial.error = resp.message.clone();
                resp.message.clone()
            } else {
                None
            };
            inner.state.send_replace(SessionState {
                phase,
                run_id: Some(run_id.clone()),
                run: Some(initial),
                fatal,
                ..SessionState::idle()
            });
            if phase == SessionPhase::Complete {
                inner.finalize_success(&run_id).await;
            }
            return Ok(run_id);
        }

        inner.state.send_replace(SessionState {
            phase: SessionPhase::Running,
            run_id: Some(run_id.clone()),
            run: Some(initial),
            verdict: None,
            connection: inner.channel.current_status(),
            fatal: None,
        });

        let token = if inner.deployment.requires_channel_token() {
            match inner.backend.channel_token(&run_id).await {
                Ok(ChannelTokenResponse { token, .. }) => Some(token),
                Err(err) => {
                    // Channel will report the missing token; polling carries on.
                    warn!(run_id = run_id.as_str(), error = %err, "Channel token mint failed");
                    None
                }
            }
        } else {
            None
        };
        // Subscribe before the socket opens so no early frame slips past.
        let messages = inner.channel.subscribe();
        let status = inner.channel.subscribe_status();
        inner.channel.start(&run_id, token).await;

        let mut tasks = inner.tasks.lock().await;
        tasks.push(tokio::spawn(listen_loop(
            inner.clone(),
            run_id.clone(),
            messages,
            status,
        )));
        tasks.push(tokio::spawn(poll_loop(inner.clone(), run_id.clone())));

        Ok(run_id)
    }

    /// Request cancellation of the active run. Fire-and-forget: a backend
    /// `cancelled: true` moves the session to `Cancelled` locally; any
    /// other outcome surfaces as a notice and leaves run state untouched.
    pub async fn cancel(&self) {
        let (run_id, phase) = {
            let s = self.inner.state.borrow();
            (s.run_id.clone(), s.phase)
        };
        let Some(run_id) = run_id else {
            self.inner
                .notify(SessionNotice::CancelFailed("no active run to cancel".to_string()));
            return;
        };
        if phase.is_terminal() {
            self.inner
                .notify(SessionNotice::CancelFailed("run already finished".to_string()));
            return;
        }

        match self.inner.backend.cancel(&run_id).await {
            Ok(resp) if resp.cancelled => {
                self.inner.diag.record(DiagnosticEvent::CancelRequested {
                    run_id: run_id.clone(),
                    accepted: true,
                });
                self.inner.state.send_modify(|s| {
                    s.phase = SessionPhase::Cancelled;
                    if let Some(run) = s.run.as_mut() {
                        if !run.status.is_terminal() {
                            run.status = RunStatus::Cancelled;
                            run.completed_at.get_or_insert(Utc::now());
                        }
                    }
                });
                self.inner.teardown().await;
            }
            Ok(resp) => {
                self.inner.diag.record(DiagnosticEvent::CancelRequested {
                    run_id: run_id.clone(),
                    accepted: false,
                });
                let message = resp
                    .message
                    .unwrap_or_else(|| "backend declined to cancel".to_string());
                self.inner.notify(SessionNotice::CancelFailed(message));
            }
            Err(err) => {
                self.inner.diag.record(DiagnosticEvent::CancelRequested {
                    run_id: run_id.clone(),
                    accepted: false,
                });
                self.inner.notify(SessionNotice::CancelFailed(err.to_string()));
            }
        }
    }

    /// Reset the channel's attempt counter and reconnect now.
    pub async fn manual_reconnect(&self) {
        self.inner.channel.manual_reconnect().await;
    }

    /// Apply one channel frame. The channel listener calls this; it is
    /// public so the merge/race behavior is testable without a socket.
    pub async fn apply_channel_message(&self, msg: &ChannelMessage) {
        self.inner.apply_channel_message(msg).await;
    }

    /// Apply one poll-style state update. Public for the same reason.
    pub async fn apply_poll_state(&self, state: RunState) {
        self.inner.apply_update(state, UpdateSource::Poll).await;
    }

    /// Tear everything down without starting a new run.
    pub async fn shutdown(&self) {
        self.inner.teardown().await;
    }
}

fn phase_for(status: &RunStatus) -> SessionPhase {
    match status {
        RunStatus::Complete => SessionPhase::Complete,
        RunStatus::Error => SessionPhase::Error,
        RunStatus::Cancelled => SessionPhase::Cancelled,
        _ => SessionPhase::Running,
    }
}

impl SessionInner {
    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    async fn teardown(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        self.channel.stop().await;
    }

    async fn apply_channel_message(&self, msg: &ChannelMessage) {
        let (active_run, phase) = {
            let s = self.state.borrow();
            (s.run_id.clone(), s.phase)
        };
        let Some(active_run) = active_run else { return };

        match msg.run_id() {
            Some(id) if id == active_run => {}
            other => {
                self.diag.record(DiagnosticEvent::FrameDropped {
                    run_id: other.unwrap_or_default().to_string(),
                    reason: "frame for inactive run".to_string(),
                });
                return;
            }
        }

        match msg {
            ChannelMessage::Status { data, .. } => {
                self.apply_update(data.clone(), UpdateSource::Channel).await;
            }
            ChannelMessage::Progress { data, .. } => {
                let mut incoming = self
                    .state
                    .borrow()
                    .run
                    .clone()
                    .unwrap_or_else(RunState::queued);
                incoming.status = RunStatus::Running;
                incoming.progress_percent = data.progress_percent;
                if data.phase.is_some() {
                    incoming.current_phase = data.phase.clone();
                }
                if data.message.is_some() {
                    incoming.message = data.message.clone();
                }
                self.apply_update(incoming, UpdateSource::Channel).await;
            }
            ChannelMessage::Verdict { data, .. } => {
                if phase.is_terminal() {
                    self.diag.record(DiagnosticEvent::StaleUpdateIgnored {
                        run_id: active_run,
                        source: UpdateSource::Channel,
                    });
                    return;
                }
                let verdict = data.clone();
                let needs_fetch = !verdict.ready || verdict.consensus.is_none();
                self.state.send_modify(|s| {
                    s.verdict = Some(verdict);
                    s.phase = SessionPhase::Complete;
                    if let Some(run) = s.run.as_mut() {
                        if !run.status.is_terminal() {
                            run.status = RunStatus::Complete;
                            run.progress_percent = 100.0;
                            run.completed_at.get_or_insert(Utc::now());
                        }
                    }
                });
                if needs_fetch {
                    self.finalize_success(&active_run).await;
                }
                self.channel.stop().await;
            }
            ChannelMessage::Error { data, .. } => {
                if phase.is_terminal() {
                    self.diag.record(DiagnosticEvent::StaleUpdateIgnored {
                        run_id: active_run,
                        source: UpdateSource::Channel,
                    });
                    return;
                }
                let message = data.message.clone();
                self.state.send_modify(|s| {
                    s.phase = SessionPhase::Error;
                    s.fatal = Some(message.clone());
                    if let Some(run) = s.run.as_mut() {
                        if !run.status.is_terminal() {
                            run.status = RunStatus::Error;
                            run.error = Some(message);
                            run.completed_at.get_or_insert(Utc::now());
                        }
                    }
                });
                self.channel.stop().await;
            }
            ChannelMessage::Ping { .. } | ChannelMessage::Pong { .. } => {}
        }
    }

    async fn apply_update(&self, incoming: RunState, source: UpdateSource) {
        let (run_id, current, phase) = {
            let s = self.state.borrow();
            (s.run_id.clone(), s.run.clone(), s.phase)
        };
        let Some(run_id) = run_id else { return };
        if phase.is_terminal() {
            self.diag.record(DiagnosticEvent::StaleUpdateIgnored { run_id, source });
            return;
        }

        let current = current.unwrap_or_else(RunState::queued);
        match merge(&current, &incoming, source) {
            MergeOutcome::Ignored => {
                self.diag.record(DiagnosticEvent::StaleUpdateIgnored { run_id, source });
            }
            MergeOutcome::Applied(merged) => {
                let new_phase = phase_for(&merged.status);
                let became_complete =
                    new_phase == SessionPhase::Complete && phase != SessionPhase::Complete;
                let fatal = if merged.status == RunStatus::Error {
                    merged.error.clone().or_else(|| merged.message.clone())
                } else {
                    None
                };
                self.state.send_modify(|s| {
                    s.run = Some(merged);
                    s.phase = new_phase;
                    if fatal.is_some() {
                        s.fatal = fatal;
                    }
                });
                if became_complete && self.state.borrow().verdict.is_none() {
                    self.finalize_success(&run_id).await;
                }
                if new_phase.is_terminal() {
                    self.channel.stop().await;
                }
            }
        }
    }

    /// One final fetch of the full verdict/patch payload, for completions
    /// discovered via polling or verdict events that arrived without it.
    async fn finalize_success(&self, run_id: &str) {
        match self.backend.verdict(run_id).await {
            Ok(verdict) if verdict.ready => {
                self.state.send_modify(|s| {
                    if s.run_id.as_deref() == Some(run_id) {
                        s.verdict = Some(verdict);
                    }
                });
            }
            Ok(_) => {
                debug!(run_id, "Verdict not ready at completion");
            }
            Err(err) => {
                warn!(run_id, error = %err, "Final verdict fetch failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Forward channel frames and connection-state changes into the session.
async fn listen_loop(
    inner: Arc<SessionInner>,
    run_id: String,
    mut messages: broadcast::Receiver<ChannelMessage>,
    mut status: watch::Receiver<ConnectionStatus>,
) {
    loop {
        tokio::select! {
            msg = messages.recv() => match msg {
                Ok(msg) => inner.apply_channel_message(&msg).await,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                if current.reason == Some(DisconnectReason::AttemptsExhausted) {
                    inner.notify(SessionNotice::Connectivity(
                        "live channel lost; continuing with status polling".to_string(),
                    ));
                }
                inner.state.send_modify(|s| {
                    if s.run_id.as_deref() == Some(run_id.as_str()) {
                        s.connection = current;
                    }
                });
            }
        }
    }
}

/// Fixed-cadence status polling. Runs while the run is live regardless of
/// channel health; duplicates are harmless because the merge rule never
/// regresses state. Poll failures are absorbed unless the channel is also
/// down for `poll_failure_grace` consecutive ticks.
async fn poll_loop(inner: Arc<SessionInner>, run_id: String) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately; the start response already gave us
    // the initial state, so skip it.
    ticker.tick().await;

    let mut consecutive_failures = 0u32;
    loop {
        ticker.tick().await;

        {
            let s = inner.state.borrow();
            if s.run_id.as_deref() != Some(run_id.as_str()) || s.phase.is_terminal() {
                break;
            }
        }

        match inner.backend.status(&run_id).await {
            Ok(resp) => {
                consecutive_failures = 0;
                inner.apply_update(resp.state, UpdateSource::Poll).await;
            }
            Err(err) => {
                consecutive_failures += 1;
                inner.diag.record(DiagnosticEvent::PollFailed {
                    run_id: run_id.clone(),
                    consecutive: consecutive_failures,
                    message: err.to_string(),
                });
                if consecutive_failures >= inner.config.poll_failure_grace
                    && inner.channel.current_status().is_disconnected()
                {
                    inner.state.send_modify(|s| {
                        if !s.phase.is_terminal() {
                            s.phase = SessionPhase::Error;
                            s.fatal = Some(
                                "backend unreachable: live channel down and polling failing"
                                    .to_string(),
                            );
                            if let Some(run) = s.run.as_mut() {
                                if !run.status.is_terminal() {
                                    run.status = RunStatus::Error;
                                }
                            }
                        }
                    });
                    inner.channel.stop().await;
                    break;
                }
            }
        }
    }
}
