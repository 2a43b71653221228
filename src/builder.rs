//! Image builds from application work trees.
//!
//! Builds shell out to the `docker` CLI and stream its output line by line
//! into a captured build log. At most one build runs per application, and a
//! global semaphore caps build parallelism across applications so a burst of
//! pushes cannot saturate the host.

use crate::error::{PipelineError, PipelineResult};
use anyhow::Context;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Image tag for one deployment. Tags embed the deployment sequence and are
/// never reused, so rollback always has an exact image to return to.
pub fn image_tag(app: &str, seq: i64) -> String {
    format!("slipway-{}:v{}", app, seq)
}

/// Successful build artifacts.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image: String,
    pub duration_secs: f64,
    pub log_path: PathBuf,
}

pub struct Builder {
    docker_path: String,
    logs_dir: PathBuf,
    build_timeout: Duration,
    build_slots: Semaphore,
    app_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Builder {
    /// Probe for the docker CLI and set up the build pool.
    pub async fn new(
        logs_dir: PathBuf,
        build_timeout: Duration,
        max_concurrent_builds: usize,
    ) -> anyhow::Result<Self> {
        let docker_path = Self::find_docker_cli().await?;
        Ok(Self::with_docker_path(
            docker_path,
            logs_dir,
            build_timeout,
            max_concurrent_builds,
        ))
    }

    /// Construct with an explicit build command instead of probing.
    pub fn with_docker_path(
        docker_path: impl Into<String>,
        logs_dir: PathBuf,
        build_timeout: Duration,
        max_concurrent_builds: usize,
    ) -> Self {
        Self {
            docker_path: docker_path.into(),
            logs_dir,
            build_timeout,
            build_slots: Semaphore::new(max_concurrent_builds.max(1)),
            app_locks: DashMap::new(),
        }
    }

    async fn find_docker_cli() -> anyhow::Result<String> {
        let paths = vec![
            "docker",
            "/usr/bin/docker",
            "/usr/local/bin/docker",
            "/opt/homebrew/bin/docker",
        ];

        for path in paths {
            if let Ok(output) = Command::new(path)
                .arg("version")
                .arg("--format")
                .arg("{{.Client.Version}}")
                .output()
                .await
            {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout);
                    info!("Found Docker CLI at {}: {}", path, version.trim());
                    return Ok(path.to_string());
                }
            }
        }

        anyhow::bail!("Docker CLI not found. Install Docker Engine or set PATH to include it.")
    }

    /// Build the image for `(app, seq)` from `worktree`.
    ///
    /// Blocks while an earlier build for the same application is running;
    /// the coordinator's supersession logic keeps that wait short.
    pub async fn build(
        &self,
        app: &str,
        seq: i64,
        worktree: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<BuildOutput> {
        let lock = self
            .app_locks
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _app_guard = lock.lock().await;

        let _slot = self
            .build_slots
            .acquire()
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("build pool closed: {}", e)))?;

        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }

        if !worktree.exists() {
            return Err(PipelineError::Build {
                app: app.to_string(),
                message: format!("work tree does not exist: {}", worktree.display()),
            });
        }
        if !worktree.join("Dockerfile").exists() {
            return Err(PipelineError::Build {
                app: app.to_string(),
                message: "no Dockerfile in work tree".to_string(),
            });
        }

        let image = image_tag(app, seq);
        let start = std::time::Instant::now();

        info!(app, seq, image = %image, "Starting image build");

        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("build")
            .arg("-t")
            .arg(&image)
            .arg(worktree)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| PipelineError::Build {
            app: app.to_string(),
            message: format!("failed to spawn {}: {}", self.docker_path, e),
        })?;

        let mut logs: Vec<String> = Vec::new();
        let streamed = tokio::time::timeout(
            self.build_timeout,
            Self::stream_build(&mut child, &mut logs, cancel),
        )
        .await;

        let status = match streamed {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.write_log(app, seq, &logs)?;
                return Err(e);
            }
            Err(_) => {
                // kill_on_drop reaps the child when `child` goes out of scope
                self.write_log(app, seq, &logs)?;
                return Err(PipelineError::Build {
                    app: app.to_string(),
                    message: format!("timed out after {}s", self.build_timeout.as_secs()),
                });
            }
        };

        let log_path = self.write_log(app, seq, &logs)?;
        let duration_secs = start.elapsed().as_secs_f64();

        if status.success() {
            info!(app, seq, image = %image, duration_secs, "Image build succeeded");
            Ok(BuildOutput {
                image,
                duration_secs,
                log_path,
            })
        } else {
            Err(PipelineError::Build {
                app: app.to_string(),
                message: format!(
                    "docker build exited with code {}; see {}",
                    status.code().unwrap_or(-1),
                    log_path.display()
                ),
            })
        }
    }

    async fn stream_build(
        child: &mut Child,
        logs: &mut Vec<String>,
        cancel: &mut watch::Receiver<bool>,
    ) -> PipelineResult<std::process::ExitStatus> {
        let stdout = child
            .stdout
            .take()
            .context("docker build stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("docker build stderr was not captured")?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut cancel_alive = true;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            info!(target: "build", "{}", line);
                            logs.push(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            warn!("Error reading build stdout: {}", e);
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            info!(target: "build", "{}", line);
                            logs.push(line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            warn!("Error reading build stderr: {}", e);
                            stderr_done = true;
                        }
                    }
                }
                changed = cancel.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            let _ = child.kill().await;
                            return Err(PipelineError::Cancelled);
                        }
                        Ok(()) => {}
                        Err(_) => cancel_alive = false,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for docker build")?;
        Ok(status)
    }

    fn write_log(&self, app: &str, seq: i64, logs: &[String]) -> PipelineResult<PathBuf> {
        let dir = self.logs_dir.join(app);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create build log dir {}", dir.display()))?;

        let path = dir.join(format!("v{}.log", seq));
        let mut content = logs.join("\n");
        content.push('\n');
        std::fs::write(&path, content)
            .with_context(|| format!("cannot write build log {}", path.display()))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn worktree_with_dockerfile(dir: &Path) {
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    }

    /// Fake build command that logs start/end markers so tests can assert
    /// two builds never overlapped.
    fn marker_script(dir: &Path, marker: &Path, sleep_secs: &str) -> PathBuf {
        let script = dir.join("fake-docker.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"start $$\" >> {marker}\nsleep {sleep}\necho \"end $$\" >> {marker}\n",
                marker = marker.display(),
                sleep = sleep_secs,
            ),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Sender leaked for the test's lifetime so the channel stays open
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn test_image_tag_embeds_sequence() {
        assert_eq!(image_tag("web", 7), "slipway-web:v7");
        assert_ne!(image_tag("web", 7), image_tag("web", 8));
    }

    #[tokio::test]
    async fn test_build_succeeds_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let builder = Builder::with_docker_path(
            "/bin/echo",
            dir.path().join("logs"),
            Duration::from_secs(30),
            2,
        );

        let mut cancel = no_cancel();
        let out = builder.build("web", 1, &worktree, &mut cancel).await.unwrap();

        assert_eq!(out.image, "slipway-web:v1");
        let log = std::fs::read_to_string(&out.log_path).unwrap();
        // echo printed its own argv, proving output was captured
        assert!(log.contains("build"));
        assert!(out.log_path.ends_with("logs/web/v1.log"));
    }

    #[tokio::test]
    async fn test_failed_build_maps_to_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let builder = Builder::with_docker_path(
            "/bin/false",
            dir.path().join("logs"),
            Duration::from_secs(30),
            2,
        );

        let mut cancel = no_cancel();
        let err = builder
            .build("web", 1, &worktree, &mut cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "build");
        assert!(err.to_string().contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_missing_dockerfile_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();

        let builder = Builder::with_docker_path(
            "/bin/true",
            dir.path().join("logs"),
            Duration::from_secs(30),
            2,
        );

        let mut cancel = no_cancel();
        let err = builder
            .build("web", 1, &worktree, &mut cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "build");
        assert!(err.to_string().contains("Dockerfile"));
    }

    #[tokio::test]
    async fn test_builds_for_one_app_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let marker = dir.path().join("marker.log");
        let script = marker_script(dir.path(), &marker, "0.2");

        let builder = Arc::new(Builder::with_docker_path(
            script.to_string_lossy().to_string(),
            dir.path().join("logs"),
            Duration::from_secs(30),
            4,
        ));

        let b1 = builder.clone();
        let w1 = worktree.clone();
        let first = tokio::spawn(async move {
            let mut cancel = no_cancel();
            b1.build("web", 1, &w1, &mut cancel).await
        });
        let b2 = builder.clone();
        let w2 = worktree.clone();
        let second = tokio::spawn(async move {
            let mut cancel = no_cancel();
            b2.build("web", 2, &w2, &mut cancel).await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let content = std::fs::read_to_string(&marker).unwrap();
        let kinds: Vec<&str> = content
            .lines()
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(kinds, vec!["start", "end", "start", "end"]);
    }

    #[tokio::test]
    async fn test_global_cap_serializes_across_apps() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let marker = dir.path().join("marker.log");
        let script = marker_script(dir.path(), &marker, "0.2");

        let builder = Arc::new(Builder::with_docker_path(
            script.to_string_lossy().to_string(),
            dir.path().join("logs"),
            Duration::from_secs(30),
            1,
        ));

        let b1 = builder.clone();
        let w1 = worktree.clone();
        let first = tokio::spawn(async move {
            let mut cancel = no_cancel();
            b1.build("web", 1, &w1, &mut cancel).await
        });
        let b2 = builder.clone();
        let w2 = worktree.clone();
        let second = tokio::spawn(async move {
            let mut cancel = no_cancel();
            b2.build("api", 1, &w2, &mut cancel).await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let content = std::fs::read_to_string(&marker).unwrap();
        let kinds: Vec<&str> = content
            .lines()
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(kinds, vec!["start", "end", "start", "end"]);
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let marker = dir.path().join("marker.log");
        let script = marker_script(dir.path(), &marker, "30");

        let builder = Builder::with_docker_path(
            script.to_string_lossy().to_string(),
            dir.path().join("logs"),
            Duration::from_secs(60),
            2,
        );

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = cancel_tx.send(true);
        });

        let start = std::time::Instant::now();
        let err = builder
            .build("web", 1, &worktree, &mut cancel_rx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("src");
        std::fs::create_dir_all(&worktree).unwrap();
        worktree_with_dockerfile(&worktree);

        let marker = dir.path().join("marker.log");
        let script = marker_script(dir.path(), &marker, "30");

        let builder = Builder::with_docker_path(
            script.to_string_lossy().to_string(),
            dir.path().join("logs"),
            Duration::from_millis(300),
            2,
        );

        let mut cancel = no_cancel();
        let err = builder
            .build("web", 1, &worktree, &mut cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "build");
        assert!(err.to_string().contains("timed out"));
    }
}
