//! Bare repository and post-receive hook management.
//!
//! Each application owns a bare repository under `repos_dir` and a checked
//! out work tree under `worktrees_dir`. The post-receive hook written at
//! init checks the pushed revision out into the work tree and reports it to
//! the daemon's hook endpoint, so a plain `git push` drives the pipeline.
//! Serving the git transport itself (ssh, smart HTTP) is not this module's
//! job.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// True for anything that could be a git revision from a hook or operator:
/// abbreviated or full hex object names.
pub fn plausible_revision(rev: &str) -> bool {
    (7..=64).contains(&rev.len()) && rev.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct GitManager {
    repos_dir: PathBuf,
    worktrees_dir: PathBuf,
    /// Base URL the post-receive hook reports pushes to
    hook_endpoint: String,
    auth_token: Option<String>,
}

impl GitManager {
    pub fn new(
        repos_dir: PathBuf,
        worktrees_dir: PathBuf,
        hook_endpoint: String,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            repos_dir,
            worktrees_dir,
            hook_endpoint,
            auth_token,
        }
    }

    pub fn repo_path(&self, app: &str) -> PathBuf {
        self.repos_dir.join(format!("{}.git", app))
    }

    pub fn worktree_path(&self, app: &str) -> PathBuf {
        self.worktrees_dir.join(app)
    }

    /// Push destination for operators on the daemon host; over ssh the same
    /// path works as `<user>@<host>:<path>`.
    pub fn remote_hint(&self, app: &str) -> String {
        self.repo_path(app).display().to_string()
    }

    /// Create the bare repository, work tree directory, and post-receive
    /// hook for an application. Safe to call again; the hook is rewritten so
    /// endpoint or token changes propagate on re-init.
    pub async fn init_repo(&self, app: &str) -> Result<()> {
        let repo = self.repo_path(app);
        let worktree = self.worktree_path(app);

        if !repo.exists() {
            info!(app, path = %repo.display(), "Creating bare repository");
            let status = Command::new("git")
                .args(["init", "--bare", "--quiet"])
                .arg(&repo)
                .status()
                .await
                .context("Failed to run git init")?;
            if !status.success() {
                anyhow::bail!("git init --bare failed for {}", repo.display());
            }
        }

        tokio::fs::create_dir_all(&worktree)
            .await
            .with_context(|| format!("Failed to create work tree {}", worktree.display()))?;

        self.write_hook(app, &repo, &worktree).await?;
        Ok(())
    }

    async fn write_hook(&self, app: &str, repo: &Path, worktree: &Path) -> Result<()> {
        let auth_header = match &self.auth_token {
            Some(token) => format!("-H \"Authorization: Bearer {}\" ", token),
            None => String::new(),
        };

        let script = format!(
            r#"#!/bin/bash
# Written by slipway; edits are overwritten on re-init.
set -u

while read oldrev newrev refname; do
    if [ "$refname" = "refs/heads/main" ] || [ "$refname" = "refs/heads/master" ]; then
        echo "slipway: checking out $newrev"
        git --work-tree="{worktree}" --git-dir="{repo}" checkout -f "$newrev"

        echo "slipway: queueing deployment of {app}"
        curl -fsS -X POST {auth}-H "Content-Type: application/json" \
            -d "{{\"revision\": \"$newrev\"}}" \
            "{endpoint}/hooks/{app}" || echo "slipway: daemon not reachable; push stored, deploy skipped"
    fi
done
"#,
            worktree = worktree.display(),
            repo = repo.display(),
            app = app,
            auth = auth_header,
            endpoint = self.hook_endpoint.trim_end_matches('/'),
        );

        let hook_path = repo.join("hooks/post-receive");
        tokio::fs::write(&hook_path, script)
            .await
            .with_context(|| format!("Failed to write {}", hook_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&hook_path).await?.permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&hook_path, perms).await?;
        }

        debug!(app, "Installed post-receive hook");
        Ok(())
    }

    /// Resolve `rev` (or HEAD) to a full object name in the app's
    /// repository. `Ok(None)` means the repository has no commits yet.
    pub async fn resolve_revision(&self, app: &str, rev: Option<&str>) -> Result<Option<String>> {
        let repo = self.repo_path(app);
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&repo)
            .args(["rev-parse", "--verify", "--end-of-options"])
            .arg(format!("{}^{{commit}}", rev.unwrap_or("HEAD")))
            .output()
            .await
            .context("Failed to run git rev-parse")?;

        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else if let Some(rev) = rev {
            anyhow::bail!("revision '{}' not found in repository for {}", rev, app)
        } else {
            Ok(None)
        }
    }

    /// Force the work tree to an exact revision, same command the
    /// post-receive hook runs.
    pub async fn checkout(&self, app: &str, revision: &str) -> Result<()> {
        let repo = self.repo_path(app);
        let worktree = self.worktree_path(app);
        tokio::fs::create_dir_all(&worktree).await?;

        let output = Command::new("git")
            .arg("--work-tree")
            .arg(&worktree)
            .arg("--git-dir")
            .arg(&repo)
            .args(["checkout", "-f", revision])
            .output()
            .await
            .context("Failed to run git checkout")?;

        if !output.status.success() {
            anyhow::bail!(
                "git checkout of {} failed for {}: {}",
                revision,
                app,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(app, revision, "Checked out work tree");
        Ok(())
    }

    /// Delete the repository and work tree. Missing directories are fine;
    /// destroy must be repeatable after a partial failure.
    pub async fn delete_repo(&self, app: &str) -> Result<()> {
        for dir in [self.repo_path(app), self.worktree_path(app)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(app, path = %dir.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", dir.display()))
                }
            }
        }
        Ok(())
    }
}
