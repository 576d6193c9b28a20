//! Problem types, problems, and problem steps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::signature::{SignatureError, SignedFields};
use crate::{b64, SpecError};

/// A grading environment: container image, template files, and named actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemType {
    /// Unique name of the problem type.
    pub name: String,
    /// Container image the actions run in.
    pub image: String,
    /// Template files copied into every container, overriding student files.
    #[serde(default, with = "b64::files", skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Vec<u8>>,
    /// Actions this problem type supports, keyed by action name.
    #[serde(default)]
    pub actions: BTreeMap<String, ProblemTypeAction>,
}

/// One named action of a problem type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemTypeAction {
    /// Command line run inside the container, split on whitespace.
    pub command: String,
    /// Output parser tag: empty, `xunit`, or `check`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parser: String,
    /// Human readable label shown while the action runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Whether the action holds an interactive session open.
    #[serde(default)]
    pub interactive: bool,
    /// Default resource ceilings.
    #[serde(flatten)]
    pub limits: ResourceLimits,
}

/// How the output of an action is turned into a report card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputParser {
    /// Pass if and only if the command exits with status zero.
    Plain,
    /// Parse `test_detail.xml` as xUnit.
    XUnit,
    /// Parse `test_detail.xml` as libcheck XML.
    Check,
}

impl ProblemTypeAction {
    /// Resolve the parser tag.
    pub fn output_parser(&self) -> Result<OutputParser, SpecError> {
        match self.parser.as_str() {
            "" => Ok(OutputParser::Plain),
            "xunit" => Ok(OutputParser::XUnit),
            "check" => Ok(OutputParser::Check),
            other => Err(SpecError::UnknownParser(other.to_string())),
        }
    }

    /// The command split into arguments.
    pub fn command_line(&self) -> Vec<String> {
        self.command.split_whitespace().map(str::to_string).collect()
    }
}

impl ProblemType {
    fn signed_fields(&self) -> SignedFields {
        let mut v = SignedFields::new();
        v.add("name", &self.name);
        v.add("image", &self.image);
        for (name, contents) in &self.files {
            v.add(format!("file-{name}"), contents);
        }
        for (name, action) in &self.actions {
            v.add(format!("action-{name}-command"), &action.command);
            v.add(format!("action-{name}-parser"), &action.parser);
            v.add(format!("action-{name}-message"), &action.message);
            v.add(
                format!("action-{name}-interactive"),
                action.interactive.to_string(),
            );
            let l = &action.limits;
            for (field, value) in [
                ("max-cpu", l.max_cpu),
                ("max-session", l.max_session),
                ("max-timeout", l.max_timeout),
                ("max-fd", l.max_fd),
                ("max-file-size", l.max_file_size),
                ("max-memory", l.max_memory),
                ("max-threads", l.max_threads),
            ] {
                v.add(format!("action-{name}-{field}"), value.to_string());
            }
        }
        v
    }

    /// Compute the problem type signature.
    pub fn compute_signature(&self, secret: &[u8]) -> String {
        self.signed_fields().sign(secret)
    }

    /// Verify a problem type signature in constant time.
    pub fn verify_signature(&self, secret: &[u8], signature: &str) -> Result<(), SignatureError> {
        self.signed_fields()
            .verify(secret, signature, "problem type")
    }
}

/// Per-sandbox resource ceilings.
///
/// CPU, session and timeout values are seconds; file size and memory are
/// megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(rename = "maxCPU", default)]
    pub max_cpu: u64,
    #[serde(rename = "maxSession", default)]
    pub max_session: u64,
    #[serde(rename = "maxTimeout", default)]
    pub max_timeout: u64,
    #[serde(rename = "maxFD", default)]
    pub max_fd: u64,
    #[serde(rename = "maxFileSize", default)]
    pub max_file_size: u64,
    #[serde(rename = "maxMemory", default)]
    pub max_memory: u64,
    #[serde(rename = "maxThreads", default)]
    pub max_threads: u64,
}

impl ResourceLimits {
    /// Apply `key=value` overrides from problem options.
    ///
    /// Options for other keys are skipped. An override of a known limit whose
    /// value does not parse is logged and ignored. Returns the ignored options.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, options: &[S]) -> Vec<String> {
        let mut ignored = Vec::new();
        for option in options {
            let option = option.as_ref();
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            let slot = match key.trim() {
                "maxCPU" => &mut self.max_cpu,
                "maxSession" => &mut self.max_session,
                "maxTimeout" => &mut self.max_timeout,
                "maxFD" => &mut self.max_fd,
                "maxFileSize" => &mut self.max_file_size,
                "maxMemory" => &mut self.max_memory,
                "maxThreads" => &mut self.max_threads,
                _ => continue,
            };
            match value.trim().parse::<u64>() {
                Ok(parsed) => *slot = parsed,
                Err(err) => {
                    warn!(option, error = %err, "ignoring unparsable limit override");
                    ignored.push(option.to_string());
                }
            }
        }
        ignored
    }
}

/// One exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(default)]
    pub id: i64,
    /// Globally unique slug.
    pub unique: String,
    #[serde(default)]
    pub note: String,
    pub problem_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form `key=value` options: limit overrides and `download=` globs.
    #[serde(default)]
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of a problem. Step numbers are one-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemStep {
    #[serde(rename = "problemID", default)]
    pub problem_id: i64,
    pub step: i64,
    pub problem_type: String,
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Files visible to the student for this step.
    #[serde(default, with = "b64::files")]
    pub files: BTreeMap<String, Vec<u8>>,
    /// Filenames the student may submit.
    #[serde(default)]
    pub whitelist: BTreeMap<String, bool>,
    /// Reference solution, when the authority chooses to ship one.
    #[serde(default, with = "b64::files", skip_serializing_if = "BTreeMap::is_empty")]
    pub solution: BTreeMap<String, Vec<u8>>,
}

fn default_weight() -> f64 {
    1.0
}

impl Problem {
    fn signed_fields(&self, steps: &[ProblemStep]) -> SignedFields {
        let mut v = SignedFields::new();
        v.add("id", self.id.to_string());
        v.add("unique", &self.unique);
        v.add("note", &self.note);
        v.add("problemType", &self.problem_type);
        v.add_all("tags", &self.tags);
        v.add_all("options", &self.options);
        v.add_time("createdAt", &self.created_at);
        v.add_time("updatedAt", &self.updated_at);
        for step in steps {
            let n = step.step;
            v.add(format!("step-{n}-problemType"), &step.problem_type);
            v.add(format!("step-{n}-note"), &step.note);
            v.add(format!("step-{n}-weight"), step.weight.to_string());
            for (name, contents) in &step.files {
                v.add(format!("step-{n}-file-{name}"), contents);
            }
            for (name, allowed) in &step.whitelist {
                v.add(format!("step-{n}-whitelist-{name}"), allowed.to_string());
            }
            for (name, contents) in &step.solution {
                v.add(format!("step-{n}-solution-{name}"), contents);
            }
        }
        v
    }

    /// Compute the problem signature over the problem and all of its steps.
    pub fn compute_signature(&self, secret: &[u8], steps: &[ProblemStep]) -> String {
        self.signed_fields(steps).sign(secret)
    }

    /// Verify a problem signature in constant time.
    pub fn verify_signature(
        &self,
        secret: &[u8],
        steps: &[ProblemStep],
        signature: &str,
    ) -> Result<(), SignatureError> {
        self.signed_fields(steps)
            .verify(secret, signature, "problem")
    }

    /// File globs requested through `download=` options.
    pub fn download_patterns(&self) -> Vec<String> {
        self.options
            .iter()
            .filter_map(|option| option.split_once('='))
            .filter(|(key, _)| key.trim() == "download")
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string)
            .collect()
    }
}
