//! Live daycare hosts, fed by their heartbeats.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use daycare_spec::{DaycareRegistration, SignatureError, VERSION};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

/// A host that has not checked in for this long is forgotten.
pub const REGISTRATION_TTL: Duration = Duration::minutes(2);

/// Largest accepted gap between a host's clock and ours.
pub const MAX_CLOCK_DRIFT: Duration = Duration::minutes(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("daycare version {found:?} does not match {expected:?}")]
    Version { found: String, expected: String },
    #[error("daycare clock is {drift_secs}s away from ours")]
    Drift { drift_secs: u64 },
    #[error("no daycare available for problem type {0:?}")]
    NoDaycare(String),
}

/// Registrations keyed by hostname.
#[derive(Debug)]
pub struct DaycareRegistry {
    secret: Vec<u8>,
    version: String,
    hosts: Mutex<HashMap<String, DaycareRegistration>>,
}

impl DaycareRegistry {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            version: VERSION.to_string(),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Accept registrations from hosts running `version` instead of ours.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, DaycareRegistration>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop registrations that have not been renewed in time.
    pub fn expire(&self, now: DateTime<Utc>) {
        self.hosts().retain(|hostname, registration| {
            let live = now - registration.time <= REGISTRATION_TTL;
            if !live {
                info!(hostname = %hostname, "daycare registration expired");
            }
            live
        });
    }

    /// Verify and store a registration, replacing any previous one from the
    /// same host. Returns the stored entry.
    pub fn insert(
        &self,
        mut registration: DaycareRegistration,
        now: DateTime<Utc>,
    ) -> Result<DaycareRegistration, RegistryError> {
        registration.verify_signature(&self.secret)?;
        if registration.version != self.version {
            return Err(RegistryError::Version {
                found: registration.version,
                expected: self.version.clone(),
            });
        }
        let drift_secs = (now - registration.time).num_seconds().unsigned_abs();
        if drift_secs > MAX_CLOCK_DRIFT.num_seconds().unsigned_abs() {
            return Err(RegistryError::Drift { drift_secs });
        }

        registration.problem_types.sort();
        registration.time = now;
        registration.version.clear();
        registration.signature.clear();

        let previous = self
            .hosts()
            .insert(registration.hostname.clone(), registration.clone());
        if previous.is_none() {
            info!(
                hostname = %registration.hostname,
                capacity = registration.capacity,
                problem_types = ?registration.problem_types,
                "daycare registered"
            );
        } else {
            debug!(hostname = %registration.hostname, "daycare renewed");
        }
        Ok(registration)
    }

    /// Pick a host for `problem_type`, weighted by capacity.
    pub fn assign(&self, problem_type: &str) -> Result<String, RegistryError> {
        self.assign_with(problem_type, &mut rand::thread_rng())
    }

    pub fn assign_with<R: Rng>(
        &self,
        problem_type: &str,
        rng: &mut R,
    ) -> Result<String, RegistryError> {
        let hosts = self.hosts();
        let mut candidates: Vec<&DaycareRegistration> = hosts
            .values()
            .filter(|r| r.capacity > 0 && r.problem_types.iter().any(|t| t == problem_type))
            .collect();
        candidates.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let total: u64 = candidates.iter().map(|r| u64::from(r.capacity)).sum();
        if total == 0 {
            return Err(RegistryError::NoDaycare(problem_type.to_string()));
        }
        let mut pick = rng.gen_range(0..total);
        for registration in candidates {
            let weight = u64::from(registration.capacity);
            if pick < weight {
                return Ok(registration.hostname.clone());
            }
            pick -= weight;
        }
        Err(RegistryError::NoDaycare(problem_type.to_string()))
    }

    /// Snapshot of every stored registration, ordered by hostname.
    pub fn list(&self) -> Vec<DaycareRegistration> {
        let mut all: Vec<DaycareRegistration> = self.hosts().values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        all
    }
}
