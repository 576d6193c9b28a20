//! Commits and the signed bundle exchanged with daycare hosts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::b64;
use crate::event::{Event, EventMessage};
use crate::problem::{Problem, ProblemStep, ProblemType};
use crate::report::ReportCard;
use crate::signature::{SignatureError, SignedFields};

/// One submission attempt for one problem step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "assignmentID", default)]
    pub assignment_id: i64,
    #[serde(rename = "problemID", default)]
    pub problem_id: i64,
    /// One-based step number.
    pub step: i64,
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    #[serde(default, with = "b64::files")]
    pub files: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<EventMessage>,
    #[serde(default)]
    pub report_card: Option<ReportCard>,
    #[serde(default)]
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upstream context a commit signature is chained to.
#[derive(Debug, Clone, Copy)]
pub struct CommitContext<'a> {
    pub problem_type_signature: &'a str,
    pub problem_signature: &'a str,
    pub hostname: &'a str,
    pub user_id: i64,
}

impl Commit {
    fn signed_fields(&self, ctx: &CommitContext<'_>) -> SignedFields {
        let mut v = SignedFields::new();
        v.add("id", self.id.to_string());
        v.add("assignment_id", self.assignment_id.to_string());
        v.add("problem_id", self.problem_id.to_string());
        v.add("step", self.step.to_string());
        v.add("action", &self.action);
        v.add("note", &self.note);
        for (name, contents) in &self.files {
            v.add(format!("file-{name}"), contents);
        }
        for (n, event) in self.transcript.iter().enumerate() {
            v.add(format!("transcript-{n}"), event.describe());
            if let Event::Files { files } = &event.event {
                for (name, contents) in files {
                    v.add(format!("transcript-{n}-file-{name}"), contents);
                }
            }
        }
        if let Some(card) = &self.report_card {
            v.add("reportcard-passed", card.passed.to_string());
            v.add("reportcard-note", &card.note);
            for (n, result) in card.results.iter().enumerate() {
                v.add(format!("reportcard-{n}-name"), &result.name);
                v.add(format!("reportcard-{n}-outcome"), result.outcome.as_str());
                if !result.details.is_empty() {
                    v.add(format!("reportcard-{n}-details"), &result.details);
                }
                if !result.context.is_empty() {
                    v.add(format!("reportcard-{n}-context"), &result.context);
                }
            }
        }
        v.add("score", self.score.to_string());
        v.add_time("created_at", &self.created_at);
        v.add_time("updated_at", &self.updated_at);
        v.add("problem_type_signature", ctx.problem_type_signature);
        v.add("problem_signature", ctx.problem_signature);
        v.add("daycare_host", ctx.hostname);
        v.add("user_id", ctx.user_id.to_string());
        v
    }

    /// Compute the commit signature chained to its upstream signatures.
    pub fn compute_signature(&self, secret: &[u8], ctx: &CommitContext<'_>) -> String {
        self.signed_fields(ctx).sign(secret)
    }

    /// Verify a commit signature in constant time.
    pub fn verify_signature(
        &self,
        secret: &[u8],
        ctx: &CommitContext<'_>,
        signature: &str,
    ) -> Result<(), SignatureError> {
        self.signed_fields(ctx).verify(secret, signature, "commit")
    }
}

/// Everything a daycare needs to run one action, plus the proof that the
/// authority produced it.
///
/// Parts are optional on the wire so an incomplete bundle can be rejected with
/// a precise message instead of a decode error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<ProblemType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub problem_type_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<Problem>,
    #[serde(default)]
    pub problem_steps: Vec<ProblemStep>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub problem_signature: String,
    /// Daycare host the bundle is signed for.
    #[serde(default)]
    pub hostname: String,
    #[serde(rename = "userID", default)]
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_signature: String,
}

impl CommitBundle {
    /// Chain context for the commit signature.
    pub fn commit_context(&self) -> CommitContext<'_> {
        CommitContext {
            problem_type_signature: &self.problem_type_signature,
            problem_signature: &self.problem_signature,
            hostname: &self.hostname,
            user_id: self.user_id,
        }
    }

    /// Fill in all three signatures, type first so the chain is consistent.
    ///
    /// Missing parts are skipped and leave their signature empty.
    pub fn sign(&mut self, secret: &[u8]) {
        if let Some(problem_type) = &self.problem_type {
            self.problem_type_signature = problem_type.compute_signature(secret);
        }
        if let Some(problem) = &self.problem {
            self.problem_signature = problem.compute_signature(secret, &self.problem_steps);
        }
        if let Some(commit) = &self.commit {
            self.commit_signature = commit.compute_signature(secret, &self.commit_context());
        }
    }

    /// Re-sign only the commit, keeping the upstream signatures.
    pub fn resign_commit(&mut self, secret: &[u8]) {
        if let Some(commit) = &self.commit {
            self.commit_signature = commit.compute_signature(secret, &self.commit_context());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_bundle;

    const SECRET: &[u8] = b"daycare-secret";

    fn verify(bundle: &CommitBundle) -> Result<(), SignatureError> {
        bundle.commit.as_ref().unwrap().verify_signature(
            SECRET,
            &bundle.commit_context(),
            &bundle.commit_signature,
        )
    }

    #[test]
    fn test_signed_bundle_verifies() {
        let bundle = sample_bundle(SECRET, Utc::now());
        assert!(!bundle.problem_type_signature.is_empty());
        assert!(!bundle.problem_signature.is_empty());
        assert!(verify(&bundle).is_ok());
    }

    #[test]
    fn test_commit_signature_sensitive_to_content() {
        let bundle = sample_bundle(SECRET, Utc::now());

        let mut changed = bundle.clone();
        changed
            .commit
            .as_mut()
            .unwrap()
            .files
            .insert("main.py".into(), b"print('hacked')\n".to_vec());
        assert!(verify(&changed).is_err());

        let mut changed = bundle.clone();
        changed.commit.as_mut().unwrap().score = 1.0;
        assert!(verify(&changed).is_err());

        let mut changed = bundle.clone();
        let mut card = ReportCard::new();
        card.add_passed_result("forged", "");
        changed.commit.as_mut().unwrap().report_card = Some(card);
        assert!(verify(&changed).is_err());

        let mut changed = bundle;
        changed
            .commit
            .as_mut()
            .unwrap()
            .transcript
            .push(EventMessage::now(Event::Exit { status: 0 }));
        assert!(verify(&changed).is_err());
    }

    #[test]
    fn test_commit_signature_covers_transcript_bytes() {
        let mut bundle = sample_bundle(SECRET, Utc::now());
        bundle.commit.as_mut().unwrap().transcript = vec![
            EventMessage::now(Event::Stdout { data: vec![0xff] }),
            EventMessage::now(Event::Files {
                files: BTreeMap::from([("out.txt".to_string(), b"A".to_vec())]),
            }),
        ];
        bundle.sign(SECRET);
        assert!(verify(&bundle).is_ok());

        let mut changed = bundle.clone();
        changed.commit.as_mut().unwrap().transcript[0].event = Event::Stdout { data: vec![0xfe] };
        assert!(verify(&changed).is_err());

        let mut changed = bundle;
        changed.commit.as_mut().unwrap().transcript[1].event = Event::Files {
            files: BTreeMap::from([("out.txt".to_string(), b"B".to_vec())]),
        };
        assert!(verify(&changed).is_err());
    }

    #[test]
    fn test_commit_signature_chained_to_upstream() {
        let bundle = sample_bundle(SECRET, Utc::now());

        let mut other_problem = bundle.clone();
        other_problem.problem_signature = "b3RoZXI=".into();
        assert_eq!(
            verify(&other_problem),
            Err(SignatureError::Mismatch("commit"))
        );

        let mut other_host = bundle.clone();
        other_host.hostname = "elsewhere.example.edu".into();
        assert!(verify(&other_host).is_err());

        let mut other_user = bundle;
        other_user.user_id += 1;
        assert!(verify(&other_user).is_err());
    }

    #[test]
    fn test_problem_signature_sensitive_to_step_files() {
        let bundle = sample_bundle(SECRET, Utc::now());
        let problem = bundle.problem.as_ref().unwrap();
        let mut steps = bundle.problem_steps.clone();
        let contents = steps[1].files.values_mut().next().unwrap();
        contents[0] ^= 0x01;
        assert!(problem
            .verify_signature(SECRET, &bundle.problem_steps, &bundle.problem_signature)
            .is_ok());
        assert!(problem
            .verify_signature(SECRET, &steps, &bundle.problem_signature)
            .is_err());
    }

    #[test]
    fn test_bundle_json_round_trip_preserves_signatures() {
        let bundle = sample_bundle(SECRET, Utc::now());
        let json = serde_json::to_string(&bundle).unwrap();
        let decoded: CommitBundle = serde_json::from_str(&json).unwrap();
        assert!(verify(&decoded).is_ok());
        assert!(json.contains("\"userID\""));
        assert!(json.contains("\"problemTypeSignature\""));
    }
}
