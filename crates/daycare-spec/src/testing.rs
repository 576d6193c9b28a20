//! Fixtures shared by unit and integration tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::commit::{Commit, CommitBundle};
use crate::problem::{Problem, ProblemStep, ProblemType, ProblemTypeAction, ResourceLimits};

pub const SAMPLE_HOST: &str = "daycare.example.edu";
pub const SAMPLE_USER: i64 = 42;

fn files(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
    entries
        .iter()
        .map(|(name, contents)| (name.to_string(), contents.as_bytes().to_vec()))
        .collect()
}

fn action(command: &str, parser: &str) -> ProblemTypeAction {
    ProblemTypeAction {
        command: command.into(),
        parser: parser.into(),
        message: String::new(),
        interactive: false,
        limits: ResourceLimits {
            max_cpu: 10,
            max_session: 1800,
            max_timeout: 20,
            max_fd: 100,
            max_file_size: 10,
            max_memory: 128,
            max_threads: 20,
        },
    }
}

/// A Python problem type with `grade` (xunit), `check`, `test`, and `lint` actions.
pub fn sample_problem_type() -> ProblemType {
    let mut actions = BTreeMap::new();
    actions.insert("grade".into(), action("make grade", "xunit"));
    actions.insert("check".into(), action("make check", "check"));
    actions.insert("test".into(), action("make test", ""));
    actions.insert("lint".into(), action("make lint", "tap"));
    ProblemType {
        name: "python3unittest".into(),
        image: "codegrinder/python3".into(),
        files: files(&[("Makefile", "grade:\n\tpython3 -m xmlrunner\n")]),
        actions,
    }
}

pub fn sample_problem() -> Problem {
    let created = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
    Problem {
        id: 7,
        unique: "fizzbuzz".into(),
        note: "FizzBuzz".into(),
        problem_type: "python3unittest".into(),
        tags: vec!["intro".into()],
        options: Vec::new(),
        created_at: created,
        updated_at: created + Duration::days(1),
    }
}

/// Two steps; step 2 ships an extra test file.
pub fn sample_steps() -> Vec<ProblemStep> {
    let mut whitelist = BTreeMap::new();
    whitelist.insert("main.py".to_string(), true);
    (1..=2)
        .map(|n| ProblemStep {
            problem_id: 7,
            step: n,
            problem_type: "python3unittest".into(),
            note: format!("Step {n}"),
            instructions: String::new(),
            weight: 1.0,
            files: if n == 1 {
                files(&[("tests/test_main.py", "import main\n")])
            } else {
                files(&[
                    ("tests/test_main.py", "import main\n"),
                    ("tests/test_more.py", "import main\n"),
                ])
            },
            whitelist: whitelist.clone(),
            solution: BTreeMap::new(),
        })
        .collect()
}

pub fn sample_commit(updated_at: DateTime<Utc>) -> Commit {
    Commit {
        id: 0,
        assignment_id: 3,
        problem_id: 7,
        step: 1,
        action: "grade".into(),
        note: String::new(),
        files: files(&[("main.py", "def fizz(n):\n    return n\n")]),
        transcript: Vec::new(),
        report_card: None,
        score: 0.0,
        created_at: updated_at,
        updated_at,
    }
}

/// A fully signed bundle for step 1 of the sample problem.
pub fn sample_bundle(secret: &[u8], updated_at: DateTime<Utc>) -> CommitBundle {
    let mut bundle = CommitBundle {
        problem_type: Some(sample_problem_type()),
        problem: Some(sample_problem()),
        problem_steps: sample_steps(),
        hostname: SAMPLE_HOST.into(),
        user_id: SAMPLE_USER,
        commit: Some(sample_commit(updated_at)),
        ..Default::default()
    };
    bundle.sign(secret);
    bundle
}
