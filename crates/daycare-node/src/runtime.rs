//! The container runtime seam.

use async_trait::async_trait;
use daycare_spec::ResourceLimits;
use tokio::sync::mpsc;

use crate::error::Result;

/// Everything needed to launch one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub uid: u32,
    pub limits: ResourceLimits,
    pub interactive: bool,
}

impl ContainerSpec {
    /// Lifetime of the container's idle process, after which the container
    /// exits on its own even if nobody removes it.
    pub fn deadline_secs(&self) -> u64 {
        if self.interactive {
            self.limits.max_session
        } else {
            self.limits.max_cpu * 2
        }
    }
}

/// A piece of process output, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Container operations used by a [`Nanny`](crate::nanny::Nanny).
///
/// Archives exchanged with `copy_in` and `copy_out` are tar streams rooted at
/// the student home directory.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container. A name collision must be reported as
    /// [`NannyError::NameInUse`](crate::error::NannyError::NameInUse).
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Extract a tar archive into the home directory.
    async fn copy_in(&self, name: &str, uid: u32, archive: Vec<u8>) -> Result<()>;

    /// Run a command as `uid`, forwarding output as it arrives. Returns the
    /// command's exit status; errors mean the exec plumbing itself failed.
    async fn exec(
        &self,
        name: &str,
        uid: u32,
        command: &[String],
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32>;

    /// Archive the whole home directory.
    async fn copy_out(&self, name: &str, uid: u32) -> Result<Vec<u8>>;

    /// Force-remove the container.
    async fn remove(&self, name: &str) -> Result<()>;
}
