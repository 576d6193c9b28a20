//! One action session: validate, run, grade, sign, respond.

use async_trait::async_trait;
use chrono::Utc;
use daycare_spec::{DaycareRequest, DaycareResponse, Event, EventMessage, ReportCard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::action::run_action;
use crate::error::BundleError;
use crate::nanny::{Nanny, NannySpec};
use crate::server::DaycareState;
use crate::transcript::Transcript;
use crate::validate::{validate_bundle, ActionRoute};

/// The only action whose result is scored and signed.
pub const GRADE_ACTION: &str = "grade";

/// Progress of a session. States only move forward; `Aborted` and
/// `Responded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitFirstMessage,
    Validated,
    SlotAcquired,
    ContainerReady,
    FilesUploaded,
    Executing,
    OutputCollected,
    Scored,
    Signed,
    Responded,
    Aborted,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("encoding response: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Where a session's response frames go.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send(&mut self, response: &DaycareResponse) -> Result<(), SinkError>;

    /// Called once after the terminal frame.
    async fn close(&mut self) {}
}

struct Session {
    state: SessionState,
}

impl Session {
    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Terminate with an error frame.
async fn abort<S: ResponseSink>(session: &mut Session, sink: &mut S, message: String) -> SessionState {
    warn!(state = ?session.state, error = %message, "session aborted");
    if let Err(err) = sink.send(&DaycareResponse::error(message)).await {
        warn!(error = %err, "failed to send error response");
    }
    sink.close().await;
    session.advance(SessionState::Aborted);
    session.state
}

/// Forward every event to the client and keep the bounded transcript.
///
/// Ends when the nanny's sender is dropped. A failed write stops further
/// sends but recording continues.
async fn relay_events<S: ResponseSink>(
    mut events: mpsc::Receiver<EventMessage>,
    mut sink: S,
    mut transcript: Transcript,
) -> (S, Transcript) {
    let mut connected = true;
    while let Some(event) = events.recv().await {
        if connected {
            if let Err(err) = sink.send(&DaycareResponse::event(event.clone())).await {
                warn!(error = %err, "client stopped receiving events");
                connected = false;
            }
        }
        transcript.record(event);
    }
    (sink, transcript)
}

/// Drive one request to its terminal state.
pub async fn run_session<S>(
    state: &DaycareState,
    route: &ActionRoute,
    request: DaycareRequest,
    mut sink: S,
) -> SessionState
where
    S: ResponseSink + 'static,
{
    let started = Utc::now();
    let mut session = Session {
        state: SessionState::AwaitFirstMessage,
    };

    let Some(bundle) = request.commit_bundle else {
        let message = BundleError::Missing("commit bundle").to_string();
        return abort(&mut session, &mut sink, message).await;
    };
    if request.stdin.is_some() {
        debug!("ignoring stdin on the opening request");
    }
    let validated =
        match validate_bundle(bundle, route, &state.secret, &state.hostname, started) {
            Ok(validated) => validated,
            Err(err) => return abort(&mut session, &mut sink, err.to_string()).await,
        };
    session.advance(SessionState::Validated);

    // Held until the function returns, on every path.
    let _permit = match state.limiter.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            let message = "daycare is shutting down".to_string();
            return abort(&mut session, &mut sink, message).await;
        }
    };
    session.advance(SessionState::SlotAcquired);

    let (events, receiver) = mpsc::channel(1);
    let transcript =
        Transcript::with_limits(state.transcript_data_limit, state.transcript_event_limit);
    let relay = tokio::spawn(relay_events(receiver, sink, transcript));

    let spec = NannySpec {
        name: format!("nanny-{}", validated.user_id),
        image: validated.problem_type.image.clone(),
        limits: validated.limits(),
        interactive: validated.action.interactive,
    };
    let created = Nanny::create(state.runtime.clone(), state.uids.clone(), spec, events).await;
    let mut nanny = match created {
        Ok(nanny) => nanny,
        Err(err) => {
            error!(error = %err, "failed to create container");
            return match relay.await {
                Ok((mut sink, _)) => {
                    let message = format!("creating container: {err}");
                    abort(&mut session, &mut sink, message).await
                }
                Err(join) => {
                    error!(error = %join, "event relay failed");
                    SessionState::Aborted
                }
            };
        }
    };
    session.advance(SessionState::ContainerReady);

    let mut card = ReportCard::new();
    let uploaded = match nanny.put_files(&validated.merged_files()).await {
        Ok(()) => true,
        Err(err) => {
            card.log_and_fail(format!("uploading files: {err}"));
            false
        }
    };
    session.advance(SessionState::FilesUploaded);

    session.advance(SessionState::Executing);
    if uploaded {
        run_action(&mut nanny, &validated.action, &mut card).await;
    }
    session.advance(SessionState::OutputCollected);

    let patterns = validated.problem.download_patterns();
    if !patterns.is_empty() {
        match nanny.get_files(&patterns).await {
            Ok(files) => nanny.emit(Event::Files { files }).await,
            Err(err) => warn!(error = %err, "failed to download files"),
        }
    }
    nanny.shutdown("action finished").await;
    drop(nanny);

    let (mut sink, transcript) = match relay.await {
        Ok(relayed) => relayed,
        Err(err) => {
            error!(error = %err, "event relay failed");
            return SessionState::Aborted;
        }
    };
    transcript.log_truncation();

    if route.action != GRADE_ACTION {
        info!(passed = card.passed, "action finished");
        sink.close().await;
        session.advance(SessionState::Responded);
        return session.state;
    }

    let mut commit = validated.commit.clone();
    commit.transcript = transcript.into_events();
    commit.score = card.score();
    commit.updated_at = started;
    info!(passed = card.passed, score = commit.score, note = %card.note, "graded");
    commit.report_card = Some(card);
    session.advance(SessionState::Scored);

    let mut bundle = validated.into_bundle(commit);
    bundle.resign_commit(&state.secret);
    session.advance(SessionState::Signed);

    if let Err(err) = sink.send(&DaycareResponse::bundle(bundle)).await {
        warn!(error = %err, "failed to send signed commit");
    }
    sink.close().await;
    session.advance(SessionState::Responded);
    session.state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use chrono::Duration;
    use daycare_spec::testing::{sample_bundle, SAMPLE_HOST};
    use daycare_spec::{CommitBundle, RESULTS_FILE};

    use crate::memory::{MemoryRuntime, ScriptedRun};

    const SECRET: &[u8] = b"session-secret";

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<DaycareResponse>>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ResponseSink for Recorder {
        async fn send(&mut self, response: &DaycareResponse) -> Result<(), SinkError> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                return Err(SinkError::Closed("gone".into()));
            }
            frames.push(response.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn frames(&self) -> Vec<DaycareResponse> {
            self.frames.lock().unwrap().clone()
        }
    }

    fn state(runtime: MemoryRuntime) -> DaycareState {
        DaycareState::new(
            SECRET.to_vec(),
            SAMPLE_HOST.to_string(),
            "https://authority.example.edu".to_string(),
            2,
            Arc::new(runtime),
        )
    }

    fn route(action: &str) -> ActionRoute {
        ActionRoute {
            problem_type: "python3unittest".into(),
            action: action.into(),
        }
    }

    fn bundle() -> CommitBundle {
        sample_bundle(SECRET, Utc::now() - Duration::minutes(1))
    }

    fn passing_runtime() -> MemoryRuntime {
        MemoryRuntime::new(|_, home: &mut BTreeMap<String, Vec<u8>>| {
            let xml = r#"<testsuite tests="1" failures="0"><testcase name="test_fizz"/></testsuite>"#;
            home.insert(RESULTS_FILE.to_string(), xml.as_bytes().to_vec());
            ScriptedRun::exit(0).with_stdout("ok\n")
        })
    }

    #[tokio::test]
    async fn test_grade_session_signs_result() {
        let state = state(passing_runtime());
        let sink = Recorder::default();
        let request = DaycareRequest::with_bundle(bundle());
        let end = run_session(&state, &route("grade"), request, sink.clone()).await;
        assert_eq!(end, SessionState::Responded);

        let frames = sink.frames();
        let last = frames.last().unwrap();
        let bundle = last.commit_bundle.as_ref().unwrap();
        let commit = bundle.commit.as_ref().unwrap();
        assert_eq!(commit.score, 1.0);
        assert!(commit.report_card.as_ref().unwrap().passed);
        assert_eq!(commit.transcript.len(), 3);
        commit
            .verify_signature(SECRET, &bundle.commit_context(), &bundle.commit_signature)
            .unwrap();
        assert!(frames[..frames.len() - 1].iter().all(|f| f.event.is_some()));
        assert_eq!(state.limiter.available(), 2);
        assert_eq!(state.uids.in_use(), 0);
    }

    #[tokio::test]
    async fn test_non_grade_action_sends_no_bundle() {
        let state = state(MemoryRuntime::exiting(1));
        let sink = Recorder::default();
        let mut bundle = bundle();
        bundle.commit.as_mut().unwrap().action = "test".into();
        bundle.sign(SECRET);
        let end = run_session(&state, &route("test"), DaycareRequest::with_bundle(bundle), sink.clone()).await;
        assert_eq!(end, SessionState::Responded);
        let frames = sink.frames();
        assert!(frames.iter().all(|f| f.commit_bundle.is_none() && f.error.is_none()));
        let last = frames.last().unwrap().event.as_ref().unwrap();
        assert_eq!(last.event, Event::Exit { status: 1 });
    }

    #[tokio::test]
    async fn test_missing_bundle_is_error_frame() {
        let state = state(MemoryRuntime::exiting(0));
        let sink = Recorder::default();
        let end = run_session(&state, &route("grade"), DaycareRequest::default(), sink.clone()).await;
        assert_eq!(end, SessionState::Aborted);
        assert_eq!(
            sink.frames()[0].error.as_deref(),
            Some("request is missing the commit bundle")
        );
    }

    #[tokio::test]
    async fn test_tampered_bundle_never_reaches_container() {
        let runtime = Arc::new(MemoryRuntime::exiting(0));
        let state = DaycareState::new(
            SECRET.to_vec(),
            SAMPLE_HOST.to_string(),
            String::new(),
            1,
            runtime.clone(),
        );
        let mut bundle = bundle();
        bundle.commit.as_mut().unwrap().files.insert("main.py".into(), b"evil".to_vec());
        let sink = Recorder::default();
        let end = run_session(&state, &route("grade"), DaycareRequest::with_bundle(bundle), sink.clone()).await;
        assert_eq!(end, SessionState::Aborted);
        assert!(sink.frames()[0].error.is_some());
        assert!(runtime.created().is_empty());
    }

    #[tokio::test]
    async fn test_container_failure_aborts_and_frees_slot() {
        let state = state(MemoryRuntime::exiting(0).with_failing_create());
        let sink = Recorder::default();
        let end = run_session(&state, &route("grade"), DaycareRequest::with_bundle(bundle()), sink.clone()).await;
        assert_eq!(end, SessionState::Aborted);
        let error = sink.frames().last().unwrap().error.clone().unwrap();
        assert!(error.starts_with("creating container"));
        assert_eq!(state.limiter.available(), 2);
    }

    async fn grade(state: &DaycareState, bundle: CommitBundle, sink: &Recorder) -> SessionState {
        let request = DaycareRequest::with_bundle(bundle);
        run_session(state, &route("grade"), request, sink.clone()).await
    }

    fn returned(frames: &[DaycareResponse]) -> CommitBundle {
        let bundle = frames.last().unwrap().commit_bundle.clone().unwrap();
        let commit = bundle.commit.as_ref().unwrap();
        commit
            .verify_signature(SECRET, &bundle.commit_context(), &bundle.commit_signature)
            .unwrap();
        bundle
    }

    fn live_events(frames: &[DaycareResponse]) -> Vec<&'static str> {
        frames
            .iter()
            .filter_map(|f| f.event.as_ref())
            .map(|e| e.event.name())
            .collect()
    }

    #[tokio::test]
    async fn test_event_budget_limits_stored_not_live_events() {
        let runtime = MemoryRuntime::new(|_, home: &mut BTreeMap<String, Vec<u8>>| {
            let xml = r#"<testsuite tests="1" failures="0"><testcase name="t"/></testsuite>"#;
            home.insert(RESULTS_FILE.to_string(), xml.as_bytes().to_vec());
            ScriptedRun::exit(0).with_stdout("out\n").with_stderr("err\n")
        });
        let state = state(runtime).with_transcript_limits(1_000, 2);
        let sink = Recorder::default();
        assert_eq!(grade(&state, bundle(), &sink).await, SessionState::Responded);

        let frames = sink.frames();
        assert_eq!(live_events(&frames), vec!["exec", "stdout", "stderr", "exit"]);
        let bundle = returned(&frames);
        let transcript = &bundle.commit.as_ref().unwrap().transcript;
        let stored: Vec<&str> = transcript.iter().map(|e| e.event.name()).collect();
        assert_eq!(stored, vec!["exec", "stdout"]);
    }

    #[tokio::test]
    async fn test_download_option_sends_files_event() {
        let runtime = MemoryRuntime::new(|_, home: &mut BTreeMap<String, Vec<u8>>| {
            let xml = r#"<testsuite tests="1" failures="0"><testcase name="t"/></testsuite>"#;
            home.insert(RESULTS_FILE.to_string(), xml.as_bytes().to_vec());
            home.insert("plot.png".to_string(), b"png".to_vec());
            ScriptedRun::exit(0)
        });
        let state = state(runtime);
        let mut bundle = bundle();
        bundle.problem.as_mut().unwrap().options = vec!["download=*.png".into()];
        bundle.sign(SECRET);
        let sink = Recorder::default();
        assert_eq!(grade(&state, bundle, &sink).await, SessionState::Responded);

        let frames = sink.frames();
        assert_eq!(live_events(&frames), vec!["exec", "exit", "files"]);
        let files_frame = frames[frames.len() - 2].event.as_ref().unwrap();
        let expected = BTreeMap::from([("plot.png".to_string(), b"png".to_vec())]);
        assert_eq!(files_frame.event, Event::Files { files: expected });
        let bundle = returned(&frames);
        assert_eq!(bundle.commit.unwrap().transcript.last(), Some(files_frame));
    }

    #[tokio::test]
    async fn test_upload_failure_is_signed_failing_result() {
        let runtime = Arc::new(MemoryRuntime::exiting(0).with_failing_copy_in());
        let state = DaycareState::new(
            SECRET.to_vec(),
            SAMPLE_HOST.to_string(),
            String::new(),
            1,
            runtime.clone(),
        );
        let sink = Recorder::default();
        assert_eq!(grade(&state, bundle(), &sink).await, SessionState::Responded);

        let frames = sink.frames();
        assert!(frames.iter().all(|f| f.error.is_none()));
        let commit = returned(&frames).commit.unwrap();
        let card = commit.report_card.unwrap();
        assert!(!card.passed);
        assert!(card.note.starts_with("uploading files: "));
        assert_eq!(commit.score, 0.0);
        assert!(runtime.executed().is_empty());
    }

    #[tokio::test]
    async fn test_client_going_away_does_not_stop_grading() {
        let state = state(passing_runtime());
        let sink = Recorder {
            fail_after: Some(1),
            ..Default::default()
        };
        let end = run_session(&state, &route("grade"), DaycareRequest::with_bundle(bundle()), sink.clone()).await;
        assert_eq!(end, SessionState::Responded);
        assert_eq!(sink.frames().len(), 1);
    }
}
