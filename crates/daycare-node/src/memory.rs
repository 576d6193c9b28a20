//! A container runtime that keeps each container's home directory in memory.
//!
//! Commands are not executed. A [`Script`] decides what each exec prints, what
//! it writes into the home directory, and how it exits. Used by the test suite
//! and for exercising the protocol on hosts without a container engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::archive;
use crate::error::{NannyError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk};

/// Outcome of one scripted exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedRun {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ScriptedRun {
    pub fn exit(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdout = data.into();
        self
    }

    pub fn with_stderr(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stderr = data.into();
        self
    }
}

/// Behavior of exec: sees the command and the home directory.
pub type Script =
    Box<dyn Fn(&[String], &mut BTreeMap<String, Vec<u8>>) -> ScriptedRun + Send + Sync>;

#[derive(Default)]
struct State {
    containers: HashMap<String, BTreeMap<String, Vec<u8>>>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    executed: Vec<Vec<String>>,
    fail_create: bool,
    fail_copy_in: bool,
    hang_exec: bool,
}

pub struct MemoryRuntime {
    script: Script,
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[String], &mut BTreeMap<String, Vec<u8>>) -> ScriptedRun + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            state: Mutex::new(State::default()),
        }
    }

    /// A runtime whose commands print nothing and exit with `status`.
    pub fn exiting(status: i32) -> Self {
        Self::new(move |_, _| ScriptedRun::exit(status))
    }

    /// Leave a container behind as if a previous session crashed.
    pub fn with_stale_container(self, name: &str) -> Self {
        self.lock().containers.insert(name.to_string(), BTreeMap::new());
        self
    }

    /// Make every create fail as if the engine were down.
    pub fn with_failing_create(self) -> Self {
        self.lock().fail_create = true;
        self
    }

    /// Make every copy into a container fail.
    pub fn with_failing_copy_in(self) -> Self {
        self.lock().fail_copy_in = true;
        self
    }

    /// Make every exec block forever, like a student program stuck in a loop.
    pub fn with_hanging_exec(self) -> Self {
        self.lock().hang_exec = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Specs of every container created so far.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    /// Every command run so far, in order.
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.lock().executed.clone()
    }

    /// Names of every container removed so far.
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Current home directory of a live container.
    pub fn files(&self, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.lock().containers.get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(NannyError::Command {
                command: "create".into(),
                status: 125,
                stderr: "container engine unavailable".into(),
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(NannyError::NameInUse(spec.name.clone()));
        }
        state.containers.insert(spec.name.clone(), BTreeMap::new());
        state.created.push(spec.clone());
        Ok(())
    }

    async fn copy_in(&self, name: &str, _uid: u32, archive: Vec<u8>) -> Result<()> {
        let files = archive::unpack(&archive)?;
        let mut state = self.lock();
        if state.fail_copy_in {
            return Err(NannyError::Command {
                command: "copy in".into(),
                status: 1,
                stderr: "no space left on device".into(),
            });
        }
        let home = state
            .containers
            .get_mut(name)
            .ok_or_else(|| NannyError::NotFound(name.to_string()))?;
        home.extend(files);
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        _uid: u32,
        command: &[String],
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32> {
        let hang = self.lock().hang_exec;
        if hang {
            return std::future::pending().await;
        }
        let run = {
            let mut state = self.lock();
            state.executed.push(command.to_vec());
            let home = state
                .containers
                .get_mut(name)
                .ok_or_else(|| NannyError::NotFound(name.to_string()))?;
            (self.script)(command, home)
        };
        if !run.stdout.is_empty() {
            let _ = output.send(OutputChunk::Stdout(run.stdout)).await;
        }
        if !run.stderr.is_empty() {
            let _ = output.send(OutputChunk::Stderr(run.stderr)).await;
        }
        Ok(run.status)
    }

    async fn copy_out(&self, name: &str, uid: u32) -> Result<Vec<u8>> {
        let files = self
            .files(name)
            .ok_or_else(|| NannyError::NotFound(name.to_string()))?;
        Ok(archive::pack(&files, uid, 0)?)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.containers.remove(name);
        state.removed.push(name.to_string());
        Ok(())
    }
}
