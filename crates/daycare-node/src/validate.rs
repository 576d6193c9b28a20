//! Admission checks for an incoming commit bundle.
//!
//! Checks run in a fixed order: completeness, the URL route, the three
//! signatures, the target host, recency, and finally step consistency. The
//! first failure wins and nothing is executed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use daycare_spec::{
    Commit, CommitBundle, CommitContext, Problem, ProblemStep, ProblemType, ProblemTypeAction,
    ResourceLimits, MAX_DAYCARE_REQUEST_AGE,
};

use crate::error::BundleError;

/// The `{problem_type}/{action}` pair a socket was opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRoute {
    pub problem_type: String,
    pub action: String,
}

/// A bundle whose signatures, host, age and step have all been checked.
#[derive(Debug, Clone)]
pub struct ValidatedBundle {
    pub problem_type: ProblemType,
    pub problem_type_signature: String,
    pub problem: Problem,
    pub steps: Vec<ProblemStep>,
    pub problem_signature: String,
    pub hostname: String,
    pub user_id: i64,
    pub commit: Commit,
    pub action: ProblemTypeAction,
}

/// Verify `bundle` for execution on `hostname`.
pub fn validate_bundle(
    bundle: CommitBundle,
    route: &ActionRoute,
    secret: &[u8],
    hostname: &str,
    now: DateTime<Utc>,
) -> Result<ValidatedBundle, BundleError> {
    let CommitBundle {
        problem_type,
        problem_type_signature,
        problem,
        problem_steps,
        problem_signature,
        hostname: bundle_host,
        user_id,
        commit,
        commit_signature,
    } = bundle;

    let problem_type = problem_type.ok_or(BundleError::Missing("problem type"))?;
    if problem_type_signature.is_empty() {
        return Err(BundleError::Missing("problem type signature"));
    }
    let problem = problem.ok_or(BundleError::Missing("problem"))?;
    if problem_steps.is_empty() {
        return Err(BundleError::Missing("problem steps"));
    }
    if problem_signature.is_empty() {
        return Err(BundleError::Missing("problem signature"));
    }
    let commit = commit.ok_or(BundleError::Missing("commit"))?;
    if commit_signature.is_empty() {
        return Err(BundleError::Missing("commit signature"));
    }
    if bundle_host.is_empty() {
        return Err(BundleError::Missing("hostname"));
    }
    if user_id < 1 {
        return Err(BundleError::InvalidUser(user_id));
    }

    if route.problem_type != problem_type.name {
        return Err(BundleError::ProblemTypeMismatch {
            url: route.problem_type.clone(),
            bundle: problem_type.name.clone(),
        });
    }
    let action = problem_type
        .actions
        .get(&route.action)
        .cloned()
        .ok_or_else(|| BundleError::UnknownAction {
            problem_type: problem_type.name.clone(),
            action: route.action.clone(),
        })?;

    problem_type.verify_signature(secret, &problem_type_signature)?;
    problem.verify_signature(secret, &problem_steps, &problem_signature)?;
    let validated = ValidatedBundle {
        problem_type,
        problem_type_signature,
        problem,
        steps: problem_steps,
        problem_signature,
        hostname: bundle_host,
        user_id,
        commit,
        action,
    };
    let context = CommitContext {
        problem_type_signature: &validated.problem_type_signature,
        problem_signature: &validated.problem_signature,
        hostname: &validated.hostname,
        user_id: validated.user_id,
    };
    validated
        .commit
        .verify_signature(secret, &context, &commit_signature)?;

    if validated.hostname != hostname {
        return Err(BundleError::WrongHost {
            bundle: validated.hostname,
            local: hostname.to_string(),
        });
    }

    let skew_secs = (now - validated.commit.updated_at)
        .num_seconds()
        .unsigned_abs();
    if skew_secs > MAX_DAYCARE_REQUEST_AGE.num_seconds().unsigned_abs() {
        return Err(BundleError::Stale { skew_secs });
    }

    if validated.commit.action != route.action {
        return Err(BundleError::ActionMismatch {
            commit: validated.commit.action.clone(),
            url: route.action.clone(),
        });
    }

    let step = validated.commit.step;
    let steps = validated.steps.len();
    if step < 1 || step as usize > steps {
        return Err(BundleError::StepOutOfRange { step, steps });
    }
    let declared = validated.step().step;
    if declared != step {
        return Err(BundleError::StepNumberMismatch {
            position: step,
            declared,
        });
    }
    if validated.step().problem_type != validated.problem_type.name {
        return Err(BundleError::StepTypeMismatch {
            step,
            found: validated.step().problem_type.clone(),
            expected: validated.problem_type.name.clone(),
        });
    }

    Ok(validated)
}

impl ValidatedBundle {
    /// The step this commit targets. Validation guarantees it is in range.
    pub fn step(&self) -> &ProblemStep {
        &self.steps[(self.commit.step - 1) as usize]
    }

    /// Files for the container: step files, then the student's files, then the
    /// problem type's templates, each overriding the previous.
    pub fn merged_files(&self) -> BTreeMap<String, Vec<u8>> {
        let mut files = self.step().files.clone();
        files.extend(self.commit.files.clone());
        files.extend(self.problem_type.files.clone());
        files
    }

    /// The action's default limits with the problem's overrides applied.
    pub fn limits(&self) -> ResourceLimits {
        let mut limits = self.action.limits;
        limits.apply_overrides(&self.problem.options);
        limits
    }

    /// Reassemble the bundle around `commit`, keeping the upstream
    /// signatures. The commit signature is left empty for re-signing.
    pub fn into_bundle(self, commit: Commit) -> CommitBundle {
        CommitBundle {
            problem_type: Some(self.problem_type),
            problem_type_signature: self.problem_type_signature,
            problem: Some(self.problem),
            problem_steps: self.steps,
            problem_signature: self.problem_signature,
            hostname: self.hostname,
            user_id: self.user_id,
            commit: Some(commit),
            commit_signature: String::new(),
        }
    }
}
