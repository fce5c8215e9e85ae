use serde_json::Value;

/// Event types that create candidate releases. Everything else is
/// acknowledged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Push,
    PrOpened,
    PrSynchronize,
    PrReopened,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PrOpened => "pull_request.opened",
            Self::PrSynchronize => "pull_request.synchronize",
            Self::PrReopened => "pull_request.reopened",
        }
    }

    pub fn is_pull_request(self) -> bool {
        !matches!(self, Self::Push)
    }
}

/// A forge event normalized across GitHub, GitLab, and Bitbucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeEvent {
    pub kind: EventKind,
    pub repo_url: String,
    pub commit_sha: String,
    pub branch: String,
    pub pusher: Option<String>,
    pub pr_number: Option<i64>,
}

/// Outcome of payload extraction.
#[derive(Debug)]
pub enum ParseOutcome {
    Relevant(ForgeEvent),
    /// Valid delivery of an event type the core does not act on.
    Ignored(&'static str),
    Malformed(&'static str),
}

/// Normalize a repo URL for matching: https form, lowercase host, no `.git`
/// suffix, no trailing slash. `git@host:path` SSH remotes fold into the same
/// form.
pub fn normalize_repo_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');

    // scp-style ssh remote: git@github.com:acme/api.git
    if let Some(rest) = raw.strip_prefix("git@")
        && let Some((host, path)) = rest.split_once(':')
    {
        let path = path.trim_end_matches(".git");
        return format!("https://{}/{}", host.to_lowercase(), path);
    }

    match url::Url::parse(raw) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let path = parsed.path().trim_end_matches('/').trim_end_matches(".git");
            format!("https://{host}{path}")
        }
        Err(_) => raw.trim_end_matches(".git").to_owned(),
    }
}

/// Strip `refs/heads/` from a git ref.
fn branch_of(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

fn str_at<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut node = payload;
    for key in path {
        node = node.get(key)?;
    }
    node.as_str()
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

/// `X-GitHub-Event: push | pull_request`.
pub fn parse_github(event_header: &str, payload: &Value) -> ParseOutcome {
    match event_header {
        "push" => {
            let Some(git_ref) = str_at(payload, &["ref"]) else {
                return ParseOutcome::Malformed("push payload missing ref");
            };
            if !git_ref.starts_with("refs/heads/") {
                return ParseOutcome::Ignored("tag push");
            }
            let Some(sha) = str_at(payload, &["after"]) else {
                return ParseOutcome::Malformed("push payload missing after");
            };
            // Branch deletion pushes carry an all-zero sha.
            if sha.chars().all(|c| c == '0') {
                return ParseOutcome::Ignored("branch deletion");
            }
            let Some(repo) = str_at(payload, &["repository", "clone_url"])
                .or_else(|| str_at(payload, &["repository", "html_url"]))
            else {
                return ParseOutcome::Malformed("push payload missing repository url");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind: EventKind::Push,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch_of(git_ref).to_owned(),
                pusher: str_at(payload, &["pusher", "name"]).map(Into::into),
                pr_number: None,
            })
        }
        "pull_request" => {
            let kind = match str_at(payload, &["action"]) {
                Some("opened") => EventKind::PrOpened,
                Some("synchronize") => EventKind::PrSynchronize,
                Some("reopened") => EventKind::PrReopened,
                Some(_) => return ParseOutcome::Ignored("pull_request action"),
                None => return ParseOutcome::Malformed("pull_request payload missing action"),
            };
            let (Some(sha), Some(branch)) = (
                str_at(payload, &["pull_request", "head", "sha"]),
                str_at(payload, &["pull_request", "head", "ref"]),
            ) else {
                return ParseOutcome::Malformed("pull_request payload missing head");
            };
            let Some(repo) = str_at(payload, &["repository", "clone_url"])
                .or_else(|| str_at(payload, &["repository", "html_url"]))
            else {
                return ParseOutcome::Malformed("pull_request payload missing repository url");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch.to_owned(),
                pusher: str_at(payload, &["sender", "login"]).map(Into::into),
                pr_number: payload
                    .get("pull_request")
                    .and_then(|pr| pr.get("number"))
                    .and_then(Value::as_i64),
            })
        }
        _ => ParseOutcome::Ignored("event type"),
    }
}

// ---------------------------------------------------------------------------
// GitLab
// ---------------------------------------------------------------------------

/// `X-Gitlab-Event: Push Hook | Merge Request Hook`.
pub fn parse_gitlab(event_header: &str, payload: &Value) -> ParseOutcome {
    match event_header {
        "Push Hook" => {
            let Some(git_ref) = str_at(payload, &["ref"]) else {
                return ParseOutcome::Malformed("push payload missing ref");
            };
            let Some(sha) = str_at(payload, &["after"]) else {
                return ParseOutcome::Malformed("push payload missing after");
            };
            if sha.chars().all(|c| c == '0') {
                return ParseOutcome::Ignored("branch deletion");
            }
            let Some(repo) = str_at(payload, &["project", "git_http_url"])
                .or_else(|| str_at(payload, &["project", "web_url"]))
            else {
                return ParseOutcome::Malformed("push payload missing project url");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind: EventKind::Push,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch_of(git_ref).to_owned(),
                pusher: str_at(payload, &["user_username"]).map(Into::into),
                pr_number: None,
            })
        }
        "Merge Request Hook" => {
            let kind = match str_at(payload, &["object_attributes", "action"]) {
                Some("open") => EventKind::PrOpened,
                Some("update") => EventKind::PrSynchronize,
                Some("reopen") => EventKind::PrReopened,
                Some(_) => return ParseOutcome::Ignored("merge_request action"),
                None => return ParseOutcome::Malformed("merge_request payload missing action"),
            };
            let (Some(sha), Some(branch)) = (
                str_at(payload, &["object_attributes", "last_commit", "id"]),
                str_at(payload, &["object_attributes", "source_branch"]),
            ) else {
                return ParseOutcome::Malformed("merge_request payload missing source");
            };
            let Some(repo) = str_at(payload, &["project", "git_http_url"])
                .or_else(|| str_at(payload, &["project", "web_url"]))
            else {
                return ParseOutcome::Malformed("merge_request payload missing project url");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch.to_owned(),
                pusher: str_at(payload, &["user", "username"]).map(Into::into),
                pr_number: payload
                    .get("object_attributes")
                    .and_then(|a| a.get("iid"))
                    .and_then(Value::as_i64),
            })
        }
        _ => ParseOutcome::Ignored("event type"),
    }
}

// ---------------------------------------------------------------------------
// Bitbucket
// ---------------------------------------------------------------------------

/// `X-Event-Key: repo:push | pullrequest:*`.
pub fn parse_bitbucket(event_header: &str, payload: &Value) -> ParseOutcome {
    match event_header {
        "repo:push" => {
            let Some(change) = payload
                .get("push")
                .and_then(|p| p.get("changes"))
                .and_then(Value::as_array)
                .and_then(|c| c.first())
            else {
                return ParseOutcome::Malformed("push payload missing changes");
            };
            let Some(new) = change.get("new") else {
                return ParseOutcome::Ignored("branch deletion");
            };
            if str_at(new, &["type"]) != Some("branch") {
                return ParseOutcome::Ignored("tag push");
            }
            let (Some(branch), Some(sha)) =
                (str_at(new, &["name"]), str_at(new, &["target", "hash"]))
            else {
                return ParseOutcome::Malformed("push payload missing target");
            };
            let Some(repo) = str_at(payload, &["repository", "links", "html", "href"]) else {
                return ParseOutcome::Malformed("push payload missing repository link");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind: EventKind::Push,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch.to_owned(),
                pusher: str_at(payload, &["actor", "nickname"]).map(Into::into),
                pr_number: None,
            })
        }
        "pullrequest:created" | "pullrequest:updated" => {
            let kind = if event_header == "pullrequest:created" {
                EventKind::PrOpened
            } else {
                EventKind::PrSynchronize
            };
            let (Some(sha), Some(branch)) = (
                str_at(payload, &["pullrequest", "source", "commit", "hash"]),
                str_at(payload, &["pullrequest", "source", "branch", "name"]),
            ) else {
                return ParseOutcome::Malformed("pullrequest payload missing source");
            };
            let Some(repo) = str_at(payload, &["repository", "links", "html", "href"]) else {
                return ParseOutcome::Malformed("pullrequest payload missing repository link");
            };

            ParseOutcome::Relevant(ForgeEvent {
                kind,
                repo_url: normalize_repo_url(repo),
                commit_sha: sha.to_owned(),
                branch: branch.to_owned(),
                pusher: str_at(payload, &["actor", "nickname"]).map(Into::into),
                pr_number: payload
                    .get("pullrequest")
                    .and_then(|pr| pr.get("id"))
                    .and_then(Value::as_i64),
            })
        }
        _ => ParseOutcome::Ignored("event type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_repo_urls() {
        assert_eq!(
            normalize_repo_url("https://github.com/Acme/API.git"),
            "https://github.com/Acme/API"
        );
        assert_eq!(
            normalize_repo_url("git@github.com:acme/api.git"),
            "https://github.com/acme/api"
        );
        assert_eq!(
            normalize_repo_url("https://GitHub.com/acme/api/"),
            "https://github.com/acme/api"
        );
    }

    #[test]
    fn github_push_parses() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "1f2e3d4c5b6a79881f2e3d4c5b6a79881f2e3d4c",
            "repository": {"clone_url": "https://github.com/acme/api.git"},
            "pusher": {"name": "aldo"},
        });

        let ParseOutcome::Relevant(event) = parse_github("push", &payload) else {
            panic!("expected relevant event");
        };
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.branch, "main");
        assert_eq!(event.repo_url, "https://github.com/acme/api");
        assert_eq!(event.pusher.as_deref(), Some("aldo"));
    }

    #[test]
    fn github_tag_push_ignored() {
        let payload = serde_json::json!({
            "ref": "refs/tags/v1.0.0",
            "after": "1f2e3d4c",
            "repository": {"clone_url": "https://github.com/acme/api.git"},
        });
        assert!(matches!(
            parse_github("push", &payload),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn github_branch_deletion_ignored() {
        let payload = serde_json::json!({
            "ref": "refs/heads/old",
            "after": "0000000000000000000000000000000000000000",
            "repository": {"clone_url": "https://github.com/acme/api.git"},
        });
        assert!(matches!(
            parse_github("push", &payload),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn github_pr_actions() {
        let mk = |action: &str| {
            serde_json::json!({
                "action": action,
                "pull_request": {
                    "number": 42,
                    "head": {"sha": "abcdef0123456789", "ref": "feature/x"},
                },
                "repository": {"clone_url": "https://github.com/acme/api.git"},
                "sender": {"login": "aldo"},
            })
        };

        for (action, kind) in [
            ("opened", EventKind::PrOpened),
            ("synchronize", EventKind::PrSynchronize),
            ("reopened", EventKind::PrReopened),
        ] {
            let ParseOutcome::Relevant(event) = parse_github("pull_request", &mk(action)) else {
                panic!("expected relevant for {action}");
            };
            assert_eq!(event.kind, kind);
            assert_eq!(event.pr_number, Some(42));
            assert_eq!(event.branch, "feature/x");
        }

        assert!(matches!(
            parse_github("pull_request", &mk("closed")),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn github_unknown_event_ignored() {
        assert!(matches!(
            parse_github("workflow_run", &serde_json::json!({})),
            ParseOutcome::Ignored(_)
        ));
    }

    #[test]
    fn github_malformed_push() {
        assert!(matches!(
            parse_github("push", &serde_json::json!({"ref": "refs/heads/main"})),
            ParseOutcome::Malformed(_)
        ));
    }

    #[test]
    fn gitlab_push_parses() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "9f8e7d6c5b4a39281f2e3d4c5b6a79881f2e3d4c",
            "project": {"git_http_url": "https://gitlab.com/acme/api.git"},
            "user_username": "aldo",
        });

        let ParseOutcome::Relevant(event) = parse_gitlab("Push Hook", &payload) else {
            panic!("expected relevant event");
        };
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.repo_url, "https://gitlab.com/acme/api");
    }

    #[test]
    fn gitlab_mr_parses() {
        let payload = serde_json::json!({
            "object_attributes": {
                "action": "open",
                "iid": 7,
                "source_branch": "feature/y",
                "last_commit": {"id": "abc123def456"},
            },
            "project": {"git_http_url": "https://gitlab.com/acme/api.git"},
            "user": {"username": "aldo"},
        });

        let ParseOutcome::Relevant(event) = parse_gitlab("Merge Request Hook", &payload) else {
            panic!("expected relevant event");
        };
        assert_eq!(event.kind, EventKind::PrOpened);
        assert_eq!(event.pr_number, Some(7));
    }

    #[test]
    fn bitbucket_push_parses() {
        let payload = serde_json::json!({
            "push": {"changes": [{
                "new": {
                    "type": "branch",
                    "name": "main",
                    "target": {"hash": "fedcba9876543210"},
                }
            }]},
            "repository": {"links": {"html": {"href": "https://bitbucket.org/acme/api"}}},
            "actor": {"nickname": "aldo"},
        });

        let ParseOutcome::Relevant(event) = parse_bitbucket("repo:push", &payload) else {
            panic!("expected relevant event");
        };
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.branch, "main");
    }

    #[test]
    fn bitbucket_pr_parses() {
        let payload = serde_json::json!({
            "pullrequest": {
                "id": 3,
                "source": {
                    "branch": {"name": "feature/z"},
                    "commit": {"hash": "0011223344556677"},
                },
            },
            "repository": {"links": {"html": {"href": "https://bitbucket.org/acme/api"}}},
        });

        let ParseOutcome::Relevant(event) = parse_bitbucket("pullrequest:created", &payload) else {
            panic!("expected relevant event");
        };
        assert_eq!(event.kind, EventKind::PrOpened);
        assert_eq!(event.pr_number, Some(3));
    }

    #[test]
    fn bitbucket_merge_event_ignored() {
        assert!(matches!(
            parse_bitbucket("pullrequest:fulfilled", &serde_json::json!({})),
            ParseOutcome::Ignored(_)
        ));
    }
}
