//! Lifecycle of the one container behind one action.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use daycare_spec::{Event, EventMessage, ResourceLimits};
use glob::{MatchOptions, Pattern};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive;
use crate::error::{NannyError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk};
use crate::uid::UidPool;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// What to launch; the uid is assigned by the nanny.
#[derive(Debug, Clone)]
pub struct NannySpec {
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub interactive: bool,
}

/// Buffered output of one exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Owns one sandbox container and narrates everything it does as events.
pub struct Nanny {
    name: String,
    uid: u32,
    start: Instant,
    timeout: Option<Duration>,
    runtime: Arc<dyn ContainerRuntime>,
    uids: UidPool,
    events: mpsc::Sender<EventMessage>,
    files: Option<BTreeMap<String, Vec<u8>>>,
    closed: bool,
}

impl Nanny {
    /// Launch the container. A stale container holding the same name is
    /// removed and creation is retried once.
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        uids: UidPool,
        spec: NannySpec,
        events: mpsc::Sender<EventMessage>,
    ) -> Result<Self> {
        let uid = uids.allocate()?;
        let timeout = (spec.limits.max_timeout > 0)
            .then(|| Duration::from_secs(spec.limits.max_timeout));
        let container = ContainerSpec {
            name: spec.name,
            image: spec.image,
            uid,
            limits: spec.limits,
            interactive: spec.interactive,
        };
        info!(
            container = %container.name,
            image = %container.image,
            uid,
            "creating container"
        );

        let created = match runtime.create(&container).await {
            Err(NannyError::NameInUse(name)) => {
                warn!(container = %name, "removing stale container");
                if let Err(err) = runtime.remove(&name).await {
                    warn!(container = %name, error = %err, "failed to remove stale container");
                }
                runtime.create(&container).await
            }
            other => other,
        };
        if let Err(err) = created {
            uids.release(uid);
            return Err(err);
        }

        Ok(Self {
            name: container.name,
            uid,
            start: Instant::now(),
            timeout,
            runtime,
            uids,
            events,
            files: None,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Time since the container was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Queue an event for the relay.
    pub async fn emit(&self, event: Event) {
        if self.events.send(EventMessage::now(event)).await.is_err() {
            debug!(container = %self.name, "event relay is gone");
        }
    }

    /// Copy files into the home directory.
    pub async fn put_files(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        if self.closed {
            return Err(NannyError::ShutDown(self.name.clone()));
        }
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(1);
        let archive = archive::pack(files, self.uid, mtime)?;
        self.runtime.copy_in(&self.name, self.uid, archive).await
    }

    /// Run a command, streaming its output as events and buffering it.
    ///
    /// A command still running after the `maxTimeout` limit is abandoned and
    /// the container is shut down.
    pub async fn exec(&mut self, command: &[String]) -> Result<ExecOutput> {
        if self.closed {
            return Err(NannyError::ShutDown(self.name.clone()));
        }
        self.emit(Event::Exec {
            command: command.to_vec(),
        })
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        let forward = async {
            let mut output = ExecOutput::default();
            while let Some(chunk) = rx.recv().await {
                let event = match chunk {
                    OutputChunk::Stdout(data) => {
                        output.stdout.extend_from_slice(&data);
                        Event::Stdout { data }
                    }
                    OutputChunk::Stderr(data) => {
                        output.stderr.extend_from_slice(&data);
                        Event::Stderr { data }
                    }
                };
                self.emit(event).await;
            }
            output
        };
        let run = async {
            tokio::join!(
                self.runtime.exec(&self.name, self.uid, command, tx),
                forward
            )
        };
        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };
        let Some((status, mut output)) = finished else {
            let secs = self.timeout.map_or(0, |limit| limit.as_secs());
            warn!(container = %self.name, secs, "command timed out");
            self.shutdown("timeout").await;
            return Err(NannyError::TimedOut(secs));
        };
        output.status = status?;

        self.emit(Event::Exit {
            status: output.status,
        })
        .await;
        Ok(output)
    }

    /// Files in the home directory matching any of `patterns`.
    ///
    /// The whole home directory is copied out on the first call and served
    /// from memory afterwards, so this keeps working after shutdown once it
    /// has been called.
    pub async fn get_files(&mut self, patterns: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
        if patterns.is_empty() {
            return Ok(BTreeMap::new());
        }
        let cache = match self.files.take() {
            Some(cache) => cache,
            None => {
                if self.closed {
                    return Err(NannyError::ShutDown(self.name.clone()));
                }
                let archive = self.runtime.copy_out(&self.name, self.uid).await?;
                archive::unpack(&archive)?
            }
        };

        let patterns: Vec<Pattern> = patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(pattern = %raw, error = %err, "skipping invalid file pattern");
                    None
                }
            })
            .collect();
        let selected = cache
            .iter()
            .filter(|(name, _)| {
                patterns
                    .iter()
                    .any(|pattern| pattern.matches_with(name, MATCH_OPTIONS))
            })
            .map(|(name, contents)| (name.clone(), contents.clone()))
            .collect();

        self.files = Some(cache);
        Ok(selected)
    }

    /// Remove the container. Later calls do nothing.
    pub async fn shutdown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(container = %self.name, reason, "shutting down container");
        if let Err(err) = self.runtime.remove(&self.name).await {
            warn!(container = %self.name, error = %err, "failed to remove container");
        }
        self.uids.release(self.uid);
    }
}

impl Drop for Nanny {
    fn drop(&mut self) {
        if !self.closed {
            warn!(container = %self.name, "nanny dropped without shutdown");
            self.uids.release(self.uid);
        }
    }
}
