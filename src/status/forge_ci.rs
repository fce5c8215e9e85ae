use serde_json::Value;

use crate::config::Config;

use super::CiStage;

/// Which forge hosts a repo, for CI status lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forge {
    GitHub,
    GitLab,
}

/// Read-only client for forge workflow status. Absent integration (no token,
/// unrecognized host) yields no CI stage rather than an error.
pub struct ForgeCiClient {
    http: reqwest::Client,
    github_base: String,
    gitlab_base: String,
    github_token: Option<String>,
    gitlab_token: Option<String>,
}

impl ForgeCiClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            github_base: config.github_api_base.clone(),
            gitlab_base: config.gitlab_api_base.clone(),
            github_token: config.github_api_token.clone(),
            gitlab_token: config.gitlab_api_token.clone(),
        }
    }

    /// CI stage for `(repo, sha)`, or `None` when no integration applies.
    /// Fetch failures degrade to `None` too; the aggregator must not break on
    /// a flaky forge.
    pub async fn fetch(&self, repo_url: &str, sha: &str) -> Option<CiStage> {
        let (forge, owner, name) = parse_repo(repo_url)?;

        let result = match forge {
            Forge::GitHub => {
                self.github_token.as_deref()?;
                self.fetch_github(&owner, &name, sha).await
            }
            Forge::GitLab => {
                self.gitlab_token.as_deref()?;
                self.fetch_gitlab(&owner, &name, sha).await
            }
        };

        match result {
            Ok(stage) => stage,
            Err(e) => {
                tracing::warn!(error = %e, repo_url, "forge CI status fetch failed");
                None
            }
        }
    }

    async fn fetch_github(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> anyhow::Result<Option<CiStage>> {
        let url = format!(
            "{}/repos/{owner}/{name}/commits/{sha}/check-runs",
            self.github_base
        );
        let response = self
            .http
            .get(&url)
            .header("User-Agent", "enclii")
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(self.github_token.as_deref().unwrap_or_default())
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        Ok(summarize_check_runs(&body).map(|status| CiStage { status }))
    }

    async fn fetch_gitlab(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> anyhow::Result<Option<CiStage>> {
        let project = format!("{owner}%2F{name}");
        let url = format!("{}/projects/{project}/pipelines?sha={sha}", self.gitlab_base);
        let response = self
            .http
            .get(&url)
            .header(
                "PRIVATE-TOKEN",
                self.gitlab_token.as_deref().unwrap_or_default(),
            )
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        Ok(summarize_pipelines(&body).map(|status| CiStage { status }))
    }
}

/// `https://github.com/acme/api` → (GitHub, "acme", "api").
pub fn parse_repo(repo_url: &str) -> Option<(Forge, String, String)> {
    let parsed = url::Url::parse(repo_url).ok()?;
    let forge = match parsed.host_str()? {
        "github.com" => Forge::GitHub,
        "gitlab.com" => Forge::GitLab,
        _ => return None,
    };

    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?.to_owned();
    let name = segments.next()?.trim_end_matches(".git").to_owned();
    Some((forge, owner, name))
}

/// GitHub check-runs → `pending | in_progress | success | failure`.
/// No check runs at all means no CI stage.
pub fn summarize_check_runs(body: &Value) -> Option<String> {
    let runs = body.get("check_runs")?.as_array()?;
    if runs.is_empty() {
        return None;
    }

    let mut all_success = true;
    for run in runs {
        let status = run.get("status").and_then(Value::as_str).unwrap_or("");
        if status != "completed" {
            return Some("in_progress".into());
        }
        match run.get("conclusion").and_then(Value::as_str) {
            Some("success" | "neutral" | "skipped") => {}
            Some("failure" | "cancelled" | "timed_out") => return Some("failure".into()),
            _ => all_success = false,
        }
    }

    Some(if all_success {
        "success".into()
    } else {
        "pending".into()
    })
}

/// GitLab pipelines for a sha → the most recent pipeline's status, mapped to
/// the shared vocabulary.
pub fn summarize_pipelines(body: &Value) -> Option<String> {
    let pipelines = body.as_array()?;
    let status = pipelines.first()?.get("status")?.as_str()?;

    Some(
        match status {
            "success" => "success",
            "failed" | "canceled" => "failure",
            "running" => "in_progress",
            "pending" | "created" | "waiting_for_resource" => "pending",
            other => other,
        }
        .to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_github_and_gitlab_repos() {
        let (forge, owner, name) = parse_repo("https://github.com/acme/api").unwrap();
        assert_eq!(forge, Forge::GitHub);
        assert_eq!((owner.as_str(), name.as_str()), ("acme", "api"));

        let (forge, _, name) = parse_repo("https://gitlab.com/acme/api.git").unwrap();
        assert_eq!(forge, Forge::GitLab);
        assert_eq!(name, "api");

        assert!(parse_repo("https://codeberg.org/acme/api").is_none());
        assert!(parse_repo("not a url").is_none());
    }

    #[test]
    fn check_runs_summary() {
        let mk = |runs: Value| serde_json::json!({ "check_runs": runs });

        assert_eq!(summarize_check_runs(&mk(serde_json::json!([]))), None);
        assert_eq!(
            summarize_check_runs(&mk(serde_json::json!([
                {"status": "completed", "conclusion": "success"},
                {"status": "in_progress", "conclusion": null},
            ]))),
            Some("in_progress".into())
        );
        assert_eq!(
            summarize_check_runs(&mk(serde_json::json!([
                {"status": "completed", "conclusion": "success"},
                {"status": "completed", "conclusion": "failure"},
            ]))),
            Some("failure".into())
        );
        assert_eq!(
            summarize_check_runs(&mk(serde_json::json!([
                {"status": "completed", "conclusion": "success"},
                {"status": "completed", "conclusion": "skipped"},
            ]))),
            Some("success".into())
        );
    }

    #[test]
    fn pipeline_summary_maps_vocabulary() {
        let body = serde_json::json!([{"status": "failed"}]);
        assert_eq!(summarize_pipelines(&body), Some("failure".into()));

        let body = serde_json::json!([{"status": "running"}]);
        assert_eq!(summarize_pipelines(&body), Some("in_progress".into()));

        assert_eq!(summarize_pipelines(&serde_json::json!([])), None);
    }

    #[tokio::test]
    async fn fetches_github_check_runs_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/api/commits/abc123/check-runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "check_runs": [{"status": "completed", "conclusion": "success"}]
            })))
            .mount(&server)
            .await;

        let client = ForgeCiClient {
            http: reqwest::Client::new(),
            github_base: server.uri(),
            gitlab_base: server.uri(),
            github_token: Some("token".into()),
            gitlab_token: None,
        };

        let stage = client
            .fetch("https://github.com/acme/api", "abc123")
            .await
            .unwrap();
        assert_eq!(stage.status, "success");
    }

    #[tokio::test]
    async fn missing_token_yields_no_stage() {
        let client = ForgeCiClient {
            http: reqwest::Client::new(),
            github_base: "http://127.0.0.1:1".into(),
            gitlab_base: "http://127.0.0.1:1".into(),
            github_token: None,
            gitlab_token: None,
        };
        assert!(
            client
                .fetch("https://github.com/acme/api", "abc")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn fetch_failure_degrades_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ForgeCiClient {
            http: reqwest::Client::new(),
            github_base: server.uri(),
            gitlab_base: server.uri(),
            github_token: Some("token".into()),
            gitlab_token: None,
        };
        assert!(
            client
                .fetch("https://github.com/acme/api", "abc")
                .await
                .is_none()
        );
    }
}
