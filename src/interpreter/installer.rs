// src/interpreter/installer.rs
//! Package installation into interpreter environments.
//!
//! Prefers `uv` when it is discoverable on PATH and falls back to running
//! `pip` through the environment's own interpreter. Requirement names are
//! written to a temporary requirements file and passed via `-r` rather than
//! interpolated into the command line. Installer output is forwarded
//! line-by-line as it is produced, not buffered until completion.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{Environment, ResponseFrame, StreamKind};
use crate::utils::errors::{CillowError, Result};

/// Installs packages into a specific environment, streaming installer output.
pub struct PackageInstaller {
    env: Environment,
    uv: Option<PathBuf>,
}

impl PackageInstaller {
    /// Create an installer for the environment, probing PATH for `uv` once.
    pub fn new(env: Environment) -> Self {
        let uv = which::which("uv").ok();
        if let Some(path) = &uv {
            debug!("using uv at {:?}", path);
        }
        Self { env, uv }
    }

    /// Override installer discovery. Used by tests.
    #[cfg(test)]
    fn with_uv(env: Environment, uv: Option<PathBuf>) -> Self {
        Self { env, uv }
    }

    /// The installer invocation for a given requirements file.
    fn build_command(&self, requirements: &Path) -> Result<(PathBuf, Vec<String>)> {
        let interpreter = self.env.interpreter()?;
        match &self.uv {
            Some(uv) => Ok((
                uv.clone(),
                vec![
                    "pip".to_string(),
                    "install".to_string(),
                    "--python".to_string(),
                    interpreter.display().to_string(),
                    "-r".to_string(),
                    requirements.display().to_string(),
                ],
            )),
            None => Ok((
                interpreter,
                vec![
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "-r".to_string(),
                    requirements.display().to_string(),
                ],
            )),
        }
    }

    /// Install `names`, forwarding each output line as an installer stream
    /// frame. Returns an error carrying the exit status on non-zero exit.
    pub async fn install(
        &self,
        names: &[String],
        env_vars: &HashMap<String, String>,
        frames: &mpsc::Sender<ResponseFrame>,
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        info!(environment = %self.env, packages = ?names, "installing requirements");

        // The requirements file keeps untrusted names out of argv.
        let mut requirements = tempfile::NamedTempFile::new()?;
        requirements.write_all(names.join("\n").as_bytes())?;
        requirements.flush()?;

        let (program, args) = self.build_command(requirements.path())?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(bin) = self.env.bin_dir() {
            command.env("PATH", prepend_path(&bin));
        }

        let mut child = command
            .spawn()
            .map_err(|e| CillowError::WorkerSpawnFailed(format!("{:?}: {}", program, e)))?;

        let stdout = child.stdout.take().ok_or(CillowError::ChannelClosed)?;
        let stderr = child.stderr.take().ok_or(CillowError::ChannelClosed)?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            let line = tokio::select! {
                line = stdout.next_line(), if stdout_open => {
                    match line? {
                        Some(line) => line,
                        None => { stdout_open = false; continue; }
                    }
                }
                line = stderr.next_line(), if stderr_open => {
                    match line? {
                        Some(line) => line,
                        None => { stderr_open = false; continue; }
                    }
                }
            };
            let frame = ResponseFrame::Stream {
                stream: StreamKind::Installer,
                text: format!("{}\n", line),
            };
            if frames.send(frame).await.is_err() {
                break;
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(CillowError::InstallerFailed(status.code().unwrap_or(-1)))
        }
    }
}

/// Prepend a directory to the current PATH value.
pub fn prepend_path(dir: &Path) -> String {
    match std::env::var("PATH") {
        Ok(path) => format!("{}:{}", dir.display(), path),
        Err(_) => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        which::which("python3").is_ok() || which::which("python").is_ok()
    }

    #[test]
    fn test_uv_command_shape() {
        if !python_available() {
            return;
        }
        let installer =
            PackageInstaller::with_uv(Environment::System, Some(PathBuf::from("/usr/bin/uv")));
        let (program, args) = installer.build_command(Path::new("/tmp/reqs.txt")).unwrap();
        assert_eq!(program, PathBuf::from("/usr/bin/uv"));
        assert_eq!(args[0], "pip");
        assert_eq!(args[1], "install");
        assert!(args.contains(&"--python".to_string()));
        assert!(args.contains(&"-r".to_string()));
    }

    #[test]
    fn test_pip_fallback_runs_through_interpreter() {
        if !python_available() {
            return;
        }
        let installer = PackageInstaller::with_uv(Environment::System, None);
        let (program, args) = installer.build_command(Path::new("/tmp/reqs.txt")).unwrap();
        assert!(program.to_string_lossy().contains("python"));
        assert_eq!(args[..3], ["-m", "pip", "install"]);
    }

    #[tokio::test]
    async fn test_empty_install_is_a_no_op() {
        let installer = PackageInstaller::with_uv(Environment::System, None);
        let (tx, mut rx) = mpsc::channel(4);
        installer
            .install(&[], &HashMap::new(), &tx)
            .await
            .unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
