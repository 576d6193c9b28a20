//! [`ContainerRuntime`] backed by the `docker` command-line tool.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use daycare_spec::STUDENT_HOME;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{NannyError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk};

/// Capabilities removed from every sandbox.
const DROPPED_CAPABILITIES: &[&str] = &[
    "NET_RAW",
    "NET_BIND_SERVICE",
    "AUDIT_READ",
    "AUDIT_WRITE",
    "DAC_OVERRIDE",
    "SETFCAP",
    "SETPCAP",
    "SETGID",
    "SETUID",
    "MKNOD",
    "CHOWN",
    "FOWNER",
    "FSETID",
    "KILL",
    "SYS_CHROOT",
];

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let l = &spec.limits;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            "none".to_string(),
            "--user".to_string(),
            format!("{0}:{0}", spec.uid),
            "--memory".to_string(),
            format!("{}m", l.max_memory),
            "--memory-swap".to_string(),
            format!("{}m", l.max_memory),
            "--pids-limit".to_string(),
            l.max_threads.to_string(),
            "--ulimit".to_string(),
            "core=0".to_string(),
            "--ulimit".to_string(),
            format!("cpu={0}:{0}", l.max_cpu),
            "--ulimit".to_string(),
            format!("fsize={0}:{0}", l.max_file_size * 1024 * 1024),
        ];
        if l.max_fd > 0 {
            args.extend(["--ulimit".to_string(), format!("nofile={0}:{0}", l.max_fd)]);
        }
        args.extend([
            "-e".to_string(),
            "USER=student".to_string(),
            "-e".to_string(),
            format!("HOME={STUDENT_HOME}"),
            "-w".to_string(),
            STUDENT_HOME.to_string(),
        ]);
        for cap in DROPPED_CAPABILITIES {
            args.extend(["--cap-drop".to_string(), (*cap).to_string()]);
        }
        args.extend([
            spec.image.clone(),
            "/bin/sleep".to_string(),
            spec.deadline_secs().to_string(),
        ]);
        args
    }

    fn exec_args(name: &str, uid: u32, interactive: bool, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.extend([
            "-u".to_string(),
            format!("{uid}:{uid}"),
            "-w".to_string(),
            STUDENT_HOME.to_string(),
            name.to_string(),
        ]);
        args.extend(command.iter().cloned());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);
        command
    }

    /// Whether the container exists and is running.
    async fn is_running(&self, name: &str) -> bool {
        let args = ["inspect", "-f", "{{.State.Running}}", name].map(String::from);
        match self.run(&args, None).await {
            Ok(stdout) => String::from_utf8_lossy(&stdout).trim() == "true",
            Err(err) => {
                debug!(container = %name, error = %err, "inspect failed");
                false
            }
        }
    }

    /// Run docker to completion, feeding `input` on stdin, and return stdout.
    async fn run(&self, args: &[String], input: Option<Vec<u8>>) -> Result<Vec<u8>> {
        debug!(args = ?args, "docker");
        let mut child = self
            .command(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NannyError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(&data).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NannyError::Command {
                command: format!("docker {}", args.first().map_or("", String::as_str)),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Forward everything `reader` produces and return the last `READ_CHUNK`
/// bytes of it.
async fn pump<R>(
    mut reader: R,
    output: mpsc::Sender<OutputChunk>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut tail = Vec::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > READ_CHUNK {
            tail.drain(..tail.len() - READ_CHUNK);
        }
        // keep draining even if nobody listens so the process cannot block
        let _ = output.send(wrap(buf[..n].to_vec())).await;
    }
}

/// Status docker uses when the daemon itself refused the exec.
const DOCKER_EXEC_FAILED: i32 = 125;

/// Split a `docker exec` exit into the command's status and failures of
/// docker itself.
///
/// A container that is gone after a non-zero exit means docker lost it, not
/// that the command failed.
fn exec_outcome(name: &str, status: i32, stderr: &[u8], running: bool) -> Result<i32> {
    if status == DOCKER_EXEC_FAILED {
        return Err(NannyError::Command {
            command: "docker exec".into(),
            status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        });
    }
    if status != 0 && !running {
        return Err(NannyError::NotFound(name.to_string()));
    }
    Ok(status)
}

#[cfg(unix)]
fn exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        match self.run(&Self::run_args(spec), None).await {
            Err(NannyError::Command { stderr, .. }) if stderr.contains("is already in use") => {
                Err(NannyError::NameInUse(spec.name.clone()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn copy_in(&self, name: &str, uid: u32, archive: Vec<u8>) -> Result<()> {
        let command = ["tar", "x", "-f", "-", "-C", STUDENT_HOME].map(String::from);
        self.run(&Self::exec_args(name, uid, true, &command), Some(archive))
            .await
            .map(|_| ())
    }

    async fn exec(
        &self,
        name: &str,
        uid: u32,
        command: &[String],
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32> {
        let args = Self::exec_args(name, uid, false, command);
        debug!(args = ?args, "docker");
        let mut child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NannyError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err, status) = tokio::join!(
            async {
                match stdout {
                    Some(stdout) => pump(stdout, output.clone(), OutputChunk::Stdout).await,
                    None => Ok(Vec::new()),
                }
            },
            async {
                match stderr {
                    Some(stderr) => pump(stderr, output.clone(), OutputChunk::Stderr).await,
                    None => Ok(Vec::new()),
                }
            },
            child.wait(),
        );
        out?;
        let stderr_tail = err?;
        let status = exit_status(status?);
        let running = status == 0 || self.is_running(name).await;
        exec_outcome(name, status, &stderr_tail, running)
    }

    async fn copy_out(&self, name: &str, uid: u32) -> Result<Vec<u8>> {
        let command = ["tar", "c", "-f", "-", "-C", STUDENT_HOME, "."].map(String::from);
        self.run(&Self::exec_args(name, uid, false, &command), None)
            .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = ["rm", "-f", name].map(String::from);
        self.run(&args, None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daycare_spec::ResourceLimits;

    fn spec(interactive: bool) -> ContainerSpec {
        ContainerSpec {
            name: "nanny-42".into(),
            image: "codegrinder/python3".into(),
            uid: 10_123,
            limits: ResourceLimits {
                max_cpu: 10,
                max_session: 1800,
                max_timeout: 20,
                max_fd: 100,
                max_file_size: 10,
                max_memory: 128,
                max_threads: 20,
            },
            interactive,
        }
    }

    fn pair(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn test_run_args_limits() {
        let args = DockerCli::run_args(&spec(false));
        assert_eq!(&args[..4], &["run", "-d", "--name", "nanny-42"]);
        assert_eq!(pair(&args, "--network"), vec!["none"]);
        assert_eq!(pair(&args, "--user"), vec!["10123:10123"]);
        assert_eq!(pair(&args, "--memory"), vec!["128m"]);
        assert_eq!(pair(&args, "--memory-swap"), vec!["128m"]);
        assert_eq!(pair(&args, "--pids-limit"), vec!["20"]);
        assert_eq!(
            pair(&args, "--ulimit"),
            vec!["core=0", "cpu=10:10", "fsize=10485760:10485760", "nofile=100:100"]
        );
        assert_eq!(pair(&args, "-e"), vec!["USER=student", "HOME=/home/student"]);
        assert_eq!(pair(&args, "--cap-drop").len(), DROPPED_CAPABILITIES.len());
        assert_eq!(
            &args[args.len() - 3..],
            &["codegrinder/python3", "/bin/sleep", "20"]
        );
    }

    #[test]
    fn test_interactive_deadline_uses_session_limit() {
        let args = DockerCli::run_args(&spec(true));
        assert_eq!(args.last().map(String::as_str), Some("1800"));
    }

    #[test]
    fn test_zero_fd_limit_is_omitted() {
        let mut spec = spec(false);
        spec.limits.max_fd = 0;
        let args = DockerCli::run_args(&spec);
        assert!(!pair(&args, "--ulimit").iter().any(|u| u.starts_with("nofile")));
    }

    #[test]
    fn test_exec_outcome() {
        assert_eq!(exec_outcome("nanny-42", 0, b"", true).unwrap(), 0);
        assert_eq!(exec_outcome("nanny-42", 2, b"FAILED", true).unwrap(), 2);
        assert_eq!(exec_outcome("nanny-42", 152, b"", true).unwrap(), 152);

        let err = exec_outcome(
            "nanny-42",
            125,
            b"Error response from daemon: container is paused\n",
            true,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "docker exec exited with status 125: Error response from daemon: container is paused"
        );

        let err = exec_outcome(
            "nanny-42",
            1,
            b"Error response from daemon: No such container: nanny-42",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, NannyError::NotFound(name) if name == "nanny-42"));
    }

    #[test]
    fn test_exec_args() {
        let command = vec!["make".to_string(), "grade".to_string()];
        let args = DockerCli::exec_args("nanny-42", 10_123, false, &command);
        assert_eq!(
            args,
            vec!["exec", "-u", "10123:10123", "-w", "/home/student", "nanny-42", "make", "grade"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let docker = DockerCli::new("/nonexistent/docker-binary");
        let err = docker.remove("nanny-1").await.unwrap_err();
        assert!(matches!(err, NannyError::Spawn { .. }));
    }
}
