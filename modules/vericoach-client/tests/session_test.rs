//! State-machine tests for the run session controller.
//!
//! A scripted fake backend stands in for the HTTP transport; channel frames
//! are applied directly through the public apply seam, the same entry point
//! the live channel listener uses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vericoach_client::{
    ChannelConfig, ClientError, DiagnosticEvent, EventChannel, RecordingSink, Result, RunBackend,
    RunSession, SessionConfig, SessionNotice, SessionPhase, UpdateSource,
};
use vericoach_common::config::DeploymentMode;
use vericoach_common::protocol::{
    CancelResponse, ChannelMessage, ChannelTokenResponse, StartOptions, StartRequest,
    StartResponse, StatusResponse, RunTarget, VerdictResponse,
};
use vericoach_common::types::{
    ConsensusResult, JudgeVerdict, RunState, RunStatus, VerdictStatus,
};

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// What `cancel` should do when called.
#[derive(Clone, Copy)]
enum CancelScript {
    Accept,
    Decline,
    TransportError,
}

struct FakeBackend {
    /// Run ids handed out by successive `start` calls.
    run_ids: Mutex<VecDeque<String>>,
    fail_start: bool,
    /// Status and message the next `start` call reports.
    start_status: RunStatus,
    start_message: Option<String>,
    cancel: CancelScript,
    cancel_calls: Mutex<Vec<String>>,
    /// States returned by successive `status` calls; empty means the poll
    /// fails with a transport error.
    statuses: Mutex<VecDeque<RunState>>,
    verdict: Option<VerdictResponse>,
}

impl FakeBackend {
    fn new(run_id: &str) -> Self {
        Self {
            run_ids: Mutex::new(VecDeque::from([run_id.to_string()])),
            fail_start: false,
            start_status: RunStatus::Queued,
            start_message: Some("queued".to_string()),
            cancel: CancelScript::Accept,
            cancel_calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::new()),
            verdict: None,
        }
    }
}

#[async_trait]
impl RunBackend for FakeBackend {
    async fn start(&self, _req: &StartRequest) -> Result<StartResponse> {
        if self.fail_start {
            return Err(ClientError::Network("connection refused".to_string()));
        }
        let run_id = self
            .run_ids
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected extra start call");
        Ok(StartResponse {
            run_id,
            status: self.start_status.clone(),
            message: self.start_message.clone(),
        })
    }

    async fn status(&self, run_id: &str) -> Result<StatusResponse> {
        match self.statuses.lock().unwrap().pop_front() {
            Some(state) => Ok(StatusResponse {
                run_id: run_id.to_string(),
                state,
            }),
            None => Err(ClientError::Network("poll timed out".to_string())),
        }
    }

    async fn verdict(&self, run_id: &str) -> Result<VerdictResponse> {
        match &self.verdict {
            Some(v) => Ok(VerdictResponse {
                run_id: run_id.to_string(),
                ..v.clone()
            }),
            None => Err(ClientError::NotReady("verdict not ready".to_string())),
        }
    }

    async fn cancel(&self, run_id: &str) -> Result<CancelResponse> {
        self.cancel_calls.lock().unwrap().push(run_id.to_string());
        match self.cancel {
            CancelScript::Accept => Ok(CancelResponse {
                cancelled: true,
                message: None,
            }),
            CancelScript::Decline => Ok(CancelResponse {
                cancelled: false,
                message: Some("run already finished".to_string()),
            }),
            CancelScript::TransportError => {
                Err(ClientError::Network("cancel request failed".to_string()))
            }
        }
    }

    async fn channel_token(&self, run_id: &str) -> Result<ChannelTokenResponse> {
        Ok(ChannelTokenResponse {
            token: format!("tok-{run_id}"),
            expires_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_session(
    backend: Arc<FakeBackend>,
    diag: Arc<RecordingSink>,
    config: SessionConfig,
) -> RunSession {
    // Nothing listens on this port; with a zero reconnect ceiling the
    // channel goes `disconnected` on its first failed connect, and frames
    // are applied through the public seam instead.
    let mut channel_config =
        ChannelConfig::new("ws://127.0.0.1:1/ws".to_string(), DeploymentMode::Local);
    channel_config.max_reconnect_attempts = 0;
    channel_config.connect_timeout = Duration::from_millis(200);
    let channel = EventChannel::new(channel_config, diag.clone());
    RunSession::new(backend, channel, config, DeploymentMode::Local, diag)
}

/// Connectivity notices from the deliberately dead test channel can
/// interleave with the notice under assertion; skip them.
async fn next_action_notice(
    notices: &mut tokio::sync::broadcast::Receiver<SessionNotice>,
) -> SessionNotice {
    loop {
        match notices.recv().await.unwrap() {
            SessionNotice::Connectivity(_) => continue,
            other => return other,
        }
    }
}

async fn start_run(session: &RunSession) -> String {
    session
        .start(
            RunTarget::Upload {
                path: "/uploads/abc".to_string(),
            },
            None,
            None,
            StartOptions::default(),
        )
        .await
        .expect("start should succeed")
}

fn running_state(progress: f32) -> RunState {
    RunState {
        status: RunStatus::Running,
        current_phase: Some("judging".to_string()),
        progress_percent: progress,
        message: None,
        started_at: None,
        completed_at: None,
        error: None,
    }
}

fn ready_verdict() -> VerdictResponse {
    VerdictResponse {
        run_id: String::new(),
        consensus: Some(ConsensusResult {
            overall_status: VerdictStatus::Pass,
            weighted_score: 0.84,
            veto_triggered: false,
            veto_reason: None,
            invariants_checked: 10,
            invariants_passed: 10,
            judges: vec![JudgeVerdict {
                role: "architect".to_string(),
                model: "judge-model-1".to_string(),
                status: VerdictStatus::Pass,
                score: 0.84,
                confidence: 0.9,
                explanation: "clean separation".to_string(),
                issues: vec![],
                suggestions: vec![],
            }],
        }),
        patches: vec![],
        ready: true,
        telemetry: None,
        report_markdown: None,
        patch_diff: None,
    }
}

fn status_frame(run_id: &str, state: RunState) -> ChannelMessage {
    ChannelMessage::Status {
        run_id: run_id.to_string(),
        timestamp: None,
        data: state,
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_assigns_run_id_and_reaches_running() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend, diag, SessionConfig::default());

    assert_eq!(session.snapshot().phase, SessionPhase::Idle);
    let run_id = start_run(&session).await;

    let snap = session.snapshot();
    assert_eq!(run_id, "run-1");
    assert_eq!(snap.phase, SessionPhase::Running);
    assert_eq!(snap.run_id.as_deref(), Some("run-1"));
    session.shutdown().await;
}

#[tokio::test]
async fn start_transport_failure_is_fatal_to_the_attempt_only() {
    let mut backend = FakeBackend::new("run-1");
    backend.fail_start = true;
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());
    let mut notices = session.subscribe_notices();

    let err = session
        .start(
            RunTarget::Repository {
                path: "/repos/demo".to_string(),
            },
            None,
            None,
            StartOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(session.snapshot().phase, SessionPhase::Idle);
    match next_action_notice(&mut notices).await {
        SessionNotice::StartFailed(msg) => assert!(msg.contains("connection refused")),
        other => panic!("expected StartFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_target_is_rejected_before_any_request() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend, diag, SessionConfig::default());

    let err = session
        .start(
            RunTarget::Upload {
                path: "  ".to_string(),
            },
            None,
            None,
            StartOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Invalid(_)));
    assert_eq!(session.snapshot().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn terminal_error_at_start_surfaces_backend_message() {
    let mut backend = FakeBackend::new("run-1");
    backend.start_status = RunStatus::Error;
    backend.start_message = Some("target archive is corrupt".to_string());
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());

    let run_id = start_run(&session).await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Error);
    assert_eq!(snap.run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(snap.fatal.as_deref(), Some("target archive is corrupt"));
    let run = snap.run.expect("run state must be present");
    assert_eq!(run.error.as_deref(), Some("target archive is corrupt"));
}

// ---------------------------------------------------------------------------
// Merge & completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_poll_never_regresses_a_completed_run() {
    let mut backend = FakeBackend::new("run-1");
    backend.verdict = Some(ready_verdict());
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag.clone(), SessionConfig::default());
    let run_id = start_run(&session).await;

    session
        .apply_channel_message(&ChannelMessage::Verdict {
            run_id: run_id.clone(),
            timestamp: None,
            data: ready_verdict(),
        })
        .await;
    assert_eq!(session.snapshot().phase, SessionPhase::Complete);

    // A poll that raced completion still says "running".
    session.apply_poll_state(running_state(55.0)).await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Complete);
    assert_eq!(snap.run.unwrap().status, RunStatus::Complete);
    assert!(diag.events().iter().any(|e| matches!(
        e,
        DiagnosticEvent::StaleUpdateIgnored { source: UpdateSource::Poll, .. }
    )));
}

#[tokio::test]
async fn progress_frames_merge_monotonically() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend, diag, SessionConfig::default());
    let run_id = start_run(&session).await;

    session
        .apply_channel_message(&status_frame(&run_id, running_state(40.0)))
        .await;
    session
        .apply_channel_message(&status_frame(&run_id, running_state(10.0)))
        .await;

    let run = session.snapshot().run.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.progress_percent, 40.0);
    session.shutdown().await;
}

#[tokio::test]
async fn verdict_event_without_payload_triggers_final_fetch() {
    let mut backend = FakeBackend::new("run-1");
    backend.verdict = Some(ready_verdict());
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());
    let run_id = start_run(&session).await;

    // In-band verdict frame arrives hollow: completion signal only.
    session
        .apply_channel_message(&ChannelMessage::Verdict {
            run_id: run_id.clone(),
            timestamp: None,
            data: VerdictResponse {
                run_id: run_id.clone(),
                consensus: None,
                patches: vec![],
                ready: false,
                telemetry: None,
                report_markdown: None,
                patch_diff: None,
            },
        })
        .await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Complete);
    let verdict = snap.verdict.expect("verdict must be fetched");
    assert!(verdict.ready);
    assert!(verdict.consensus.is_some());
}

#[tokio::test]
async fn poll_discovering_terminal_success_completes_and_fetches_verdict() {
    let mut backend = FakeBackend::new("run-1");
    backend.verdict = Some(ready_verdict());
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());
    let _run_id = start_run(&session).await;

    let mut complete = running_state(100.0);
    complete.status = RunStatus::Complete;
    session.apply_poll_state(complete).await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Complete);
    assert!(snap.verdict.is_some());
}

#[tokio::test]
async fn error_frame_moves_run_to_error_with_message() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend, diag, SessionConfig::default());
    let run_id = start_run(&session).await;

    session
        .apply_channel_message(&ChannelMessage::Error {
            run_id: run_id.clone(),
            timestamp: None,
            data: vericoach_common::protocol::ChannelErrorPayload {
                message: "pipeline crashed in judging".to_string(),
                detail: None,
            },
        })
        .await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Error);
    assert_eq!(snap.fatal.as_deref(), Some("pipeline crashed in judging"));
    assert_eq!(snap.run.unwrap().status, RunStatus::Error);
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_calls_backend_with_exact_run_id_and_goes_terminal() {
    let backend = Arc::new(FakeBackend::new("run-7"));
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend.clone(), diag.clone(), SessionConfig::default());
    let run_id = start_run(&session).await;

    session.cancel().await;

    assert_eq!(*backend.cancel_calls.lock().unwrap(), vec![run_id]);
    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Cancelled);
    assert_eq!(snap.run.unwrap().status, RunStatus::Cancelled);
    assert!(diag.events().contains(&DiagnosticEvent::CancelRequested {
        run_id: "run-7".to_string(),
        accepted: true,
    }));
}

#[tokio::test]
async fn cancel_transport_failure_surfaces_notice_and_keeps_run_state() {
    let mut backend = FakeBackend::new("run-1");
    backend.cancel = CancelScript::TransportError;
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());
    let _run_id = start_run(&session).await;
    let mut notices = session.subscribe_notices();

    session.cancel().await;

    match next_action_notice(&mut notices).await {
        SessionNotice::CancelFailed(msg) => assert!(msg.contains("cancel request failed")),
        other => panic!("expected CancelFailed, got {other:?}"),
    }
    // The run keeps running; the user may retry cancel.
    assert_eq!(session.snapshot().phase, SessionPhase::Running);
    session.shutdown().await;
}

#[tokio::test]
async fn declined_cancel_keeps_state_and_reports_backend_message() {
    let mut backend = FakeBackend::new("run-1");
    backend.cancel = CancelScript::Decline;
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(Arc::new(backend), diag, SessionConfig::default());
    let _run_id = start_run(&session).await;
    let mut notices = session.subscribe_notices();

    session.cancel().await;

    match next_action_notice(&mut notices).await {
        SessionNotice::CancelFailed(msg) => assert!(msg.contains("already finished")),
        other => panic!("expected CancelFailed, got {other:?}"),
    }
    assert_eq!(session.snapshot().phase, SessionPhase::Running);
    session.shutdown().await;
}

// ---------------------------------------------------------------------------
// Run replacement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_run_discards_old_data_and_ignores_old_run_frames() {
    let backend = Arc::new(FakeBackend {
        run_ids: Mutex::new(VecDeque::from(["run-1".to_string(), "run-2".to_string()])),
        fail_start: false,
        start_status: RunStatus::Queued,
        start_message: Some("queued".to_string()),
        cancel: CancelScript::Accept,
        cancel_calls: Mutex::new(Vec::new()),
        statuses: Mutex::new(VecDeque::new()),
        verdict: Some(ready_verdict()),
    });
    let diag = Arc::new(RecordingSink::new());
    let session = make_session(backend, diag.clone(), SessionConfig::default());

    let first = start_run(&session).await;
    session
        .apply_channel_message(&ChannelMessage::Verdict {
            run_id: first.clone(),
            timestamp: None,
            data: ready_verdict(),
        })
        .await;
    assert!(session.snapshot().verdict.is_some());

    let second = start_run(&session).await;
    let snap = session.snapshot();
    assert_eq!(snap.run_id.as_deref(), Some("run-2"));
    assert!(snap.verdict.is_none(), "previous verdict must be discarded");
    assert_eq!(snap.phase, SessionPhase::Running);

    // A straggler frame from the old run must not touch the new one.
    session
        .apply_channel_message(&status_frame(&first, running_state(99.0)))
        .await;
    let snap = session.snapshot();
    assert_eq!(snap.run_id.as_deref(), Some("run-2"));
    assert_eq!(snap.run.unwrap().progress_percent, 0.0);
    assert!(diag
        .events()
        .iter()
        .any(|e| matches!(e, DiagnosticEvent::FrameDropped { .. })));

    assert_ne!(first, second);
    session.shutdown().await;
}

// ---------------------------------------------------------------------------
// Polling backstop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continuous_poll_failures_with_channel_down_end_in_error() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    let diag = Arc::new(RecordingSink::new());
    let config = SessionConfig {
        poll_interval: Duration::from_millis(20),
        poll_failure_grace: 3,
    };
    let session = make_session(backend, diag.clone(), config);
    let _run_id = start_run(&session).await;

    // Backend has no scripted statuses: every poll fails. The channel is
    // pointed at a closed port, so it is down throughout.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Error);
    assert!(snap.fatal.unwrap().contains("unreachable"));
    assert!(diag
        .events()
        .iter()
        .any(|e| matches!(e, DiagnosticEvent::PollFailed { consecutive: 3, .. })));
}

#[tokio::test]
async fn poll_loop_applies_scripted_states_and_recovers_from_one_failure() {
    let backend = Arc::new(FakeBackend::new("run-1"));
    backend
        .statuses
        .lock()
        .unwrap()
        .extend([running_state(30.0)]);
    let diag = Arc::new(RecordingSink::new());
    let config = SessionConfig {
        poll_interval: Duration::from_millis(20),
        poll_failure_grace: 50,
    };
    let session = make_session(backend.clone(), diag.clone(), config);
    let _run_id = start_run(&session).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = session.snapshot();
    assert_eq!(snap.phase, SessionPhase::Running);
    assert_eq!(snap.run.unwrap().progress_percent, 30.0);
    // The empty script then fails polls, absorbed below the grace threshold.
    assert!(diag
        .events()
        .iter()
        .any(|e| matches!(e, DiagnosticEvent::PollFailed { .. })));
    session.shutdown().await;
}
