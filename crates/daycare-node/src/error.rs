use daycare_spec::SignatureError;
use thiserror::Error;

/// Reasons a commit bundle is refused before any container is touched.
#[derive(Debug, Error, PartialEq)]
pub enum BundleError {
    #[error("request is missing the {0}")]
    Missing(&'static str),
    #[error("invalid user id {0}")]
    InvalidUser(i64),
    #[error("problem type {url:?} in the URL does not match the bundle's {bundle:?}")]
    ProblemTypeMismatch { url: String, bundle: String },
    #[error("problem type {problem_type:?} has no action {action:?}")]
    UnknownAction { problem_type: String, action: String },
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("commit bundle is signed for host {bundle:?}, not {local:?}")]
    WrongHost { bundle: String, local: String },
    #[error("commit timestamp is {skew_secs}s away from now")]
    Stale { skew_secs: u64 },
    #[error("commit action {commit:?} does not match the URL action {url:?}")]
    ActionMismatch { commit: String, url: String },
    #[error("commit step {step} is out of range for a problem with {steps} steps")]
    StepOutOfRange { step: i64, steps: usize },
    #[error("problem step {position} is numbered {declared}")]
    StepNumberMismatch { position: i64, declared: i64 },
    #[error("step {step} has problem type {found:?}, expected {expected:?}")]
    StepTypeMismatch {
        step: i64,
        found: String,
        expected: String,
    },
}

/// Container runtime and sandbox failures.
#[derive(Debug, Error)]
pub enum NannyError {
    #[error("more than {0} container uids in use")]
    UidsExhausted(usize),
    #[error("container name {0} is already in use")]
    NameInUse(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("timed out after {0}s")]
    TimedOut(u64),
    #[error("container {0} has already been shut down")]
    ShutDown(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no such container {0}")]
    NotFound(String),
}

pub type Result<T, E = NannyError> = std::result::Result<T, E>;
