use std::path::Path;

use tokio::process::Command;

/// Source materialization failures, split by retry semantics: a missing
/// commit will never appear, a network hiccup probably will.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source checkout failed: {0}")]
    Deterministic(String),

    #[error("source fetch unavailable: {0}")]
    Transient(String),
}

/// Materialize the repository at `git_sha` into `dir` with a shallow,
/// single-commit fetch. The scratch directory is owned by the caller and
/// removed with it.
#[tracing::instrument(skip(repo_url, dir), fields(%git_sha), err)]
pub async fn materialize(repo_url: &str, git_sha: &str, dir: &Path) -> Result<(), SourceError> {
    run_git(dir, &["init", "--quiet"]).await?;
    run_git(dir, &["remote", "add", "origin", repo_url]).await?;
    run_git(dir, &["fetch", "--quiet", "--depth", "1", "origin", git_sha]).await?;
    run_git(dir, &["checkout", "--quiet", "FETCH_HEAD"]).await?;
    Ok(())
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<(), SourceError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .await
        .map_err(|e| SourceError::Transient(format!("failed to spawn git: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(classify_git_failure(&stderr))
}

/// A commit or ref the remote does not have is a deterministic failure;
/// everything else (DNS, timeouts, auth flakes on the forge side) is worth a
/// retry.
fn classify_git_failure(stderr: &str) -> SourceError {
    let lower = stderr.to_lowercase();
    let deterministic = lower.contains("couldn't find remote ref")
        || lower.contains("not our ref")
        || lower.contains("bad object")
        || lower.contains("repository not found")
        || lower.contains("pathspec");

    if deterministic {
        SourceError::Deterministic(stderr.trim().to_owned())
    } else {
        SourceError::Transient(stderr.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ref_is_deterministic() {
        let err = classify_git_failure("fatal: couldn't find remote ref deadbeef");
        assert!(matches!(err, SourceError::Deterministic(_)));
    }

    #[test]
    fn missing_repo_is_deterministic() {
        let err = classify_git_failure("remote: Repository not found.");
        assert!(matches!(err, SourceError::Deterministic(_)));
    }

    #[test]
    fn network_failure_is_transient() {
        let err = classify_git_failure("fatal: unable to access 'https://…': Could not resolve host");
        assert!(matches!(err, SourceError::Transient(_)));
    }

    #[tokio::test]
    async fn materialize_from_local_repo() {
        // Build a tiny source repo, then materialize a specific commit.
        let origin = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            let origin = origin.path().to_owned();
            let args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
            async move {
                let out = Command::new("git")
                    .arg("-C")
                    .arg(&origin)
                    .args(&args)
                    .env("GIT_AUTHOR_NAME", "t")
                    .env("GIT_AUTHOR_EMAIL", "t@t")
                    .env("GIT_COMMITTER_NAME", "t")
                    .env("GIT_COMMITTER_EMAIL", "t@t")
                    .output()
                    .await
                    .unwrap();
                assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
                String::from_utf8_lossy(&out.stdout).trim().to_owned()
            }
        };

        git(&["init", "--quiet", "-b", "main"]).await;
        std::fs::write(origin.path().join("app.txt"), "v1").unwrap();
        git(&["add", "."]).await;
        git(&["commit", "--quiet", "-m", "one"]).await;
        let sha = git(&["rev-parse", "HEAD"]).await;

        let scratch = tempfile::tempdir().unwrap();
        materialize(origin.path().to_str().unwrap(), &sha, scratch.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(scratch.path().join("app.txt")).unwrap(),
            "v1"
        );
    }

    #[tokio::test]
    async fn materialize_unknown_sha_fails() {
        let origin = tempfile::tempdir().unwrap();
        let out = Command::new("git")
            .arg("-C")
            .arg(origin.path())
            .args(["init", "--quiet"])
            .output()
            .await
            .unwrap();
        assert!(out.status.success());

        let scratch = tempfile::tempdir().unwrap();
        let result = materialize(
            origin.path().to_str().unwrap(),
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            scratch.path(),
        )
        .await;
        assert!(result.is_err());
    }
}
