//! Sending a signed bundle to a daycare and checking what comes back.

use chrono::{DateTime, Utc};
use daycare_spec::{
    CommitBundle, DaycareRequest, DaycareResponse, EventMessage, SignatureError,
    MAX_DAYCARE_REQUEST_AGE,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("bundle is missing the {0}")]
    Missing(&'static str),
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("daycare refused the request: {0}")]
    Daycare(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("commit timestamp is {skew_secs}s away from now")]
    Stale { skew_secs: u64 },
}

/// Everything a daycare sent for one action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    /// Events in arrival order.
    pub events: Vec<EventMessage>,
    /// The signed result; only the `grade` action returns one.
    pub bundle: Option<CommitBundle>,
}

/// Socket URL for an action on `host`. A bare hostname gets `wss://`; a
/// value that already has a scheme is used as the base as given.
pub fn socket_url(host: &str, problem_type: &str, action: &str) -> String {
    let base = host.trim_end_matches('/');
    if base.contains("://") {
        format!("{base}/v2/sockets/{problem_type}/{action}")
    } else {
        format!("wss://{base}/v2/sockets/{problem_type}/{action}")
    }
}

/// Run `bundle`'s commit action on the daycare at `host`.
///
/// Returns once the daycare closes the socket or sends a terminal frame.
pub async fn dispatch(host: &str, bundle: CommitBundle) -> Result<DispatchOutcome, DispatchError> {
    let problem_type = bundle
        .problem_type
        .as_ref()
        .ok_or(DispatchError::Missing("problem type"))?
        .name
        .clone();
    let action = bundle
        .commit
        .as_ref()
        .ok_or(DispatchError::Missing("commit"))?
        .action
        .clone();
    let url = socket_url(host, &problem_type, &action);

    let (socket, _) = connect_async(url.as_str()).await?;
    info!(url = %url, "dispatching action");
    let (mut write, mut read) = socket.split();
    let request = serde_json::to_string(&DaycareRequest::with_bundle(bundle))?;
    write.send(Message::Text(request.into())).await?;

    let mut outcome = DispatchOutcome::default();
    while let Some(frame) = read.next().await {
        let response: DaycareResponse = match frame? {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            Message::Close(_) => break,
            _ => continue,
        };
        if let Some(error) = response.error {
            return Err(DispatchError::Daycare(error));
        }
        if let Some(event) = response.event {
            debug!(event = event.event.name(), "event");
            outcome.events.push(event);
        }
        if let Some(bundle) = response.commit_bundle {
            outcome.bundle = Some(bundle);
            break;
        }
    }
    // best effort; the daycare may already be gone
    let _ = write.close().await;
    Ok(outcome)
}

/// Check the whole signature chain of a returned bundle and its age.
pub fn verify_returned_bundle(
    secret: &[u8],
    bundle: &CommitBundle,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let problem_type = bundle
        .problem_type
        .as_ref()
        .ok_or(DispatchError::Missing("problem type"))?;
    let problem = bundle
        .problem
        .as_ref()
        .ok_or(DispatchError::Missing("problem"))?;
    let commit = bundle
        .commit
        .as_ref()
        .ok_or(DispatchError::Missing("commit"))?;

    problem_type.verify_signature(secret, &bundle.problem_type_signature)?;
    problem.verify_signature(secret, &bundle.problem_steps, &bundle.problem_signature)?;
    commit.verify_signature(secret, &bundle.commit_context(), &bundle.commit_signature)?;

    let skew_secs = (now - commit.updated_at).num_seconds().unsigned_abs();
    if skew_secs > MAX_DAYCARE_REQUEST_AGE.num_seconds().unsigned_abs() {
        return Err(DispatchError::Stale { skew_secs });
    }
    Ok(())
}
