//! Daycare host: runs signed actions against student code in sandboxes.
//!
//! A client opens a WebSocket at `/v2/sockets/{problem_type}/{action}` and
//! sends one [`DaycareRequest`](daycare_spec::DaycareRequest) carrying a
//! signed commit bundle. The host verifies the signature chain, waits for a
//! free slot, starts a container through a [`ContainerRuntime`], runs the
//! action's command and streams every event back. For the `grade` action the
//! commit is scored, re-signed and returned as the final frame.
//!
//! ```text
//! socket ──► validate ──► limiter ──► Nanny ──► run_action ──► sign ──► socket
//!                                       │
//!                                       └── events ──► relay ──► socket + transcript
//! ```

pub mod action;
pub mod archive;
pub mod docker;
pub mod error;
pub mod heartbeat;
pub mod limiter;
pub mod memory;
pub mod nanny;
pub mod parsers;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transcript;
pub mod uid;
pub mod validate;

pub use error::{BundleError, NannyError, Result};
pub use heartbeat::Heartbeat;
pub use limiter::Limiter;
pub use nanny::{ExecOutput, Nanny, NannySpec};
pub use runtime::{ContainerRuntime, ContainerSpec, OutputChunk};
pub use server::{router, DaycareState};
pub use session::{run_session, ResponseSink, SessionState};
pub use transcript::Transcript;
pub use uid::UidPool;
pub use validate::{validate_bundle, ActionRoute, ValidatedBundle};
