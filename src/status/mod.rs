pub mod aggregator;
pub mod forge_ci;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read-side join of CI, build, and deploy state for one
/// `(service, commit)` pair. Missing stages are skipped, not defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedBuildStatus {
    pub service_id: Uuid,
    pub git_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci: Option<CiStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployStage>,
    pub overall_status: OverallStatus,
}

/// Forge workflow status, present only when a CI integration is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiStage {
    /// `pending | in_progress | success | failure`
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    pub release_id: Uuid,
    pub version: i64,
    /// Release row status: `pending | building | ready | failed`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStage {
    pub deployment_id: Uuid,
    pub environment_id: Uuid,
    /// Deployment row status: `pending | deploying | running | failed | stopped`
    pub status: String,
    pub health: String,
    pub ready_replicas: i32,
    pub replicas: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Building,
    Ready,
    Deploying,
    Running,
    Failed,
}

/// Composition rule: failed if any present stage failed; else running if the
/// deploy stage runs; else deploying while the deploy stage is active; else
/// ready once the build is; else building while anything is in progress;
/// else pending.
pub fn overall_status(
    ci: Option<&str>,
    build: Option<&str>,
    deploy: Option<&str>,
) -> OverallStatus {
    let failed = |s: &&str| matches!(*s, "failed" | "failure");
    if ci.as_ref().is_some_and(failed)
        || build.as_ref().is_some_and(failed)
        || deploy.as_ref().is_some_and(failed)
    {
        return OverallStatus::Failed;
    }

    match deploy {
        Some("running") => return OverallStatus::Running,
        Some("pending" | "deploying") => return OverallStatus::Deploying,
        _ => {}
    }

    if build == Some("ready") {
        return OverallStatus::Ready;
    }

    let in_progress = |s: &&str| matches!(*s, "building" | "in_progress" | "queued");
    if build.as_ref().is_some_and(in_progress) || ci.as_ref().is_some_and(in_progress) {
        return OverallStatus::Building;
    }

    OverallStatus::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // any failed stage dominates
    #[case(Some("success"), Some("failed"), None, OverallStatus::Failed)]
    #[case(Some("failure"), Some("ready"), Some("running"), OverallStatus::Failed)]
    #[case(None, Some("ready"), Some("failed"), OverallStatus::Failed)]
    // deploy stage drives once present
    #[case(None, Some("ready"), Some("running"), OverallStatus::Running)]
    #[case(None, Some("ready"), Some("deploying"), OverallStatus::Deploying)]
    #[case(None, Some("ready"), Some("pending"), OverallStatus::Deploying)]
    // superseded deploy falls back to the build stage
    #[case(None, Some("ready"), Some("stopped"), OverallStatus::Ready)]
    // build stage
    #[case(None, Some("ready"), None, OverallStatus::Ready)]
    #[case(None, Some("building"), None, OverallStatus::Building)]
    #[case(Some("in_progress"), Some("pending"), None, OverallStatus::Building)]
    #[case(Some("queued"), None, None, OverallStatus::Building)]
    // nothing in flight
    #[case(None, Some("pending"), None, OverallStatus::Pending)]
    #[case(None, None, None, OverallStatus::Pending)]
    // missing stages are skipped, not treated as pending
    #[case(Some("success"), Some("ready"), None, OverallStatus::Ready)]
    fn composition_rule(
        #[case] ci: Option<&str>,
        #[case] build: Option<&str>,
        #[case] deploy: Option<&str>,
        #[case] expected: OverallStatus,
    ) {
        assert_eq!(overall_status(ci, build, deploy), expected);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_value(OverallStatus::Deploying).unwrap();
        assert_eq!(json, "deploying");
    }

    #[test]
    fn missing_stages_omitted_from_json() {
        let status = UnifiedBuildStatus {
            service_id: Uuid::new_v4(),
            git_sha: "abc".into(),
            ci: None,
            build: None,
            deploy: None,
            overall_status: OverallStatus::Pending,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("ci").is_none());
        assert!(json.get("build").is_none());
        assert_eq!(json["overall_status"], "pending");
    }
}
