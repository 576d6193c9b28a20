//! Signed heartbeat a daycare host posts to the authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signature::{SignatureError, SignedFields};

/// A daycare host advertising its problem types and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaycareRegistration {
    pub hostname: String,
    pub problem_types: Vec<String>,
    /// Relative weight used when assigning work.
    pub capacity: u32,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl DaycareRegistration {
    fn signed_fields(&self) -> SignedFields {
        let mut problem_types = self.problem_types.clone();
        problem_types.sort();

        let mut v = SignedFields::new();
        v.add("hostname", &self.hostname);
        for (n, problem_type) in problem_types.iter().enumerate() {
            v.add(format!("problemType-{n}"), problem_type);
        }
        v.add("capacity", self.capacity.to_string());
        v.add_time("time", &self.time);
        v.add("version", &self.version);
        v
    }

    /// Compute the signature and store it on the registration.
    pub fn sign(&mut self, secret: &[u8]) {
        self.signature = self.signed_fields().sign(secret);
    }

    pub fn verify_signature(&self, secret: &[u8]) -> Result<(), SignatureError> {
        self.signed_fields()
            .verify(secret, &self.signature, "registration")
    }
}
