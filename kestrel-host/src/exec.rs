//! Command execution, local or over SSH
//!
//! The driver never links libvirt; it shells out to `virsh`, `qemu-img`,
//! `ip` and `iptables` through this executor so the same code path serves a
//! local hypervisor and a remote one reached over SSH. Tests inject a mock.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

pub struct CommandOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Trait for executing commands - allows mocking in tests and swapping the
/// local variant for the SSH one.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error>;

    /// Like `execute`, feeding `stdin` to the child. Used for `virsh define
    /// /dev/stdin`, `tee`, and `iptables-restore`.
    async fn execute_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &[u8],
    ) -> Result<CommandOutput, std::io::Error>;

    /// Spawn a long-lived child with piped stdio (console tunnels, the
    /// migration process).
    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Child, std::io::Error>;
}

/// Executor that runs commands on the local host
pub struct LocalExecutor;

fn base_command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        let output = base_command(program, args).output().await?;
        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn execute_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &[u8],
    ) -> Result<CommandOutput, std::io::Error> {
        let mut cmd = base_command(program, args);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            pipe.write_all(stdin).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Child, std::io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd.spawn()
    }
}

/// Executor that runs every command on a remote host through `ssh`
pub struct SshExecutor {
    user: String,
    host: String,
    identity: Option<String>,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>, host: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            identity,
        }
    }

    /// Build the ssh argv wrapping `program args...`. Arguments are
    /// single-quoted so the remote shell passes them through verbatim.
    fn ssh_argv(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(identity) = &self.identity {
            if Path::new(identity).exists() {
                argv.push("-i".to_string());
                argv.push(identity.clone());
            }
        }
        argv.push(format!("{}@{}", self.user, self.host));
        argv.push("--".to_string());
        let mut remote = shell_quote(program);
        for arg in args {
            remote.push(' ');
            remote.push_str(&shell_quote(arg));
        }
        argv.push(remote);
        argv
    }
}

fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        let argv = self.ssh_argv(program, args);
        let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        LocalExecutor.execute("ssh", &refs).await
    }

    async fn execute_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &[u8],
    ) -> Result<CommandOutput, std::io::Error> {
        let argv = self.ssh_argv(program, args);
        let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        LocalExecutor.execute_with_stdin("ssh", &refs, stdin).await
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Child, std::io::Error> {
        let argv = self.ssh_argv(program, args);
        let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        LocalExecutor.spawn("ssh", &refs).await
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;

    /// Scripted executor: answers each invocation from a queue (or a default
    /// success) and records the full command lines for assertions.
    pub struct MockExecutor {
        pub invocations: parking_lot::Mutex<Vec<String>>,
        responses: parking_lot::Mutex<VecDeque<(i32, String, String)>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self {
                invocations: parking_lot::Mutex::new(Vec::new()),
                responses: parking_lot::Mutex::new(VecDeque::new()),
            }
        }

        pub fn push_response(&self, code: i32, stdout: &str, stderr: &str) {
            self.responses
                .lock()
                .push_back((code, stdout.to_string(), stderr.to_string()));
        }

        pub fn commands(&self) -> Vec<String> {
            self.invocations.lock().clone()
        }

        fn answer(&self, program: &str, args: &[&str]) -> CommandOutput {
            self.invocations
                .lock()
                .push(format!("{} {}", program, args.join(" ")));
            let (code, stdout, stderr) = self
                .responses
                .lock()
                .pop_front()
                .unwrap_or((0, String::new(), String::new()));
            CommandOutput {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn execute(
            &self,
            program: &str,
            args: &[&str],
        ) -> Result<CommandOutput, std::io::Error> {
            Ok(self.answer(program, args))
        }

        async fn execute_with_stdin(
            &self,
            program: &str,
            args: &[&str],
            _stdin: &[u8],
        ) -> Result<CommandOutput, std::io::Error> {
            Ok(self.answer(program, args))
        }

        async fn spawn(&self, _program: &str, _args: &[&str]) -> Result<Child, std::io::Error> {
            // A trivial long-lived child with piped stdio.
            let mut cmd = Command::new("cat");
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
            cmd.spawn()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_argv_wraps_and_quotes() {
        let executor = SshExecutor::new("root", "198.51.100.1", None);
        let argv = executor.ssh_argv("virsh", &["domstate", "web 1"]);
        assert_eq!(argv.last().unwrap(), "virsh domstate 'web 1'");
        assert!(argv.contains(&"root@198.51.100.1".to_string()));
        assert!(argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn quoting_keeps_plain_words_bare() {
        assert_eq!(shell_quote("qemu-img"), "qemu-img");
        assert_eq!(shell_quote("/var/lib/a.qcow2"), "/var/lib/a.qcow2");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn local_executor_runs_and_pipes_stdin() {
        let out = LocalExecutor.execute("echo", &["hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_str().trim(), "hello");

        let out = LocalExecutor
            .execute_with_stdin("cat", &[], b"piped")
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "piped");
    }
}
