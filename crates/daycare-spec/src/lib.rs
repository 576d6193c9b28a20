//! Data model shared by daycare hosts and the grading authority.
//!
//! Problem types, problems, steps and commits travel together in a
//! [`CommitBundle`]. Each part carries an HMAC-SHA256 signature over a
//! canonical field encoding, and the commit signature is chained to the
//! problem type signature, the problem signature, the daycare hostname and
//! the user id. A daycare host only runs work it can verify, and the
//! authority only records results it can verify.

pub mod b64;
pub mod commit;
pub mod event;
pub mod problem;
pub mod registration;
pub mod report;
pub mod signature;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use chrono::Duration;
use thiserror::Error;

pub use commit::{Commit, CommitBundle, CommitContext};
pub use event::{Event, EventMessage};
pub use problem::{OutputParser, Problem, ProblemStep, ProblemType, ProblemTypeAction, ResourceLimits};
pub use registration::DaycareRegistration;
pub use report::{Outcome, ReportCard, ReportCardResult};
pub use signature::{SignatureError, SignedFields};
pub use wire::{DaycareRequest, DaycareResponse};

/// Maximum age of a commit bundle accepted by a daycare host.
pub const MAX_DAYCARE_REQUEST_AGE: Duration = Duration::minutes(15);

/// Total stream bytes kept in a commit transcript.
pub const TRANSCRIPT_DATA_LIMIT: usize = 100_000;

/// Number of events kept in a commit transcript.
pub const TRANSCRIPT_EVENT_COUNT_LIMIT: usize = 500;

/// File the unit test runners write their results to.
pub const RESULTS_FILE: &str = "test_detail.xml";

/// Working directory and `$HOME` inside every container.
pub const STUDENT_HOME: &str = "/home/student";

/// Version reported in daycare registrations.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors from interpreting shared data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("unknown parser {0:?}")]
    UnknownParser(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_signature_is_deterministic(
            fields in proptest::collection::btree_map("[a-z-]{1,8}", proptest::collection::vec(any::<Vec<u8>>(), 0..3), 0..6),
            secret in proptest::collection::vec(any::<u8>(), 0..40),
        ) {
            let mut a = SignedFields::new();
            let mut b = SignedFields::new();
            for (key, values) in &fields {
                for value in values {
                    a.add(key.clone(), value);
                }
            }
            for (key, values) in fields.iter().rev() {
                for value in values {
                    b.add(key.clone(), value);
                }
            }
            let sig = a.sign(&secret);
            prop_assert_eq!(&sig, &b.sign(&secret));
            prop_assert!(b.verify(&secret, &sig, "fields").is_ok());
        }
    }
}
