use crate::error::ApiError;

pub fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), ApiError> {
    let len = value.len();
    if len < min || len > max {
        return Err(ApiError::BadRequest(format!(
            "{field} must be between {min} and {max} characters (got {len})"
        )));
    }
    Ok(())
}

/// Project slugs and service names: DNS-label-ish, used in hostnames and
/// cluster resource names.
pub fn check_slug(field: &str, value: &str) -> Result<(), ApiError> {
    check_length(field, value, 1, 63)?;
    let ok = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if !ok {
        return Err(ApiError::BadRequest(format!(
            "{field} must be lowercase alphanumeric with interior hyphens"
        )));
    }
    Ok(())
}

pub fn check_git_sha(value: &str) -> Result<(), ApiError> {
    if !(7..=64).contains(&value.len()) || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::BadRequest("invalid git sha".into()));
    }
    Ok(())
}

pub fn check_url(field: &str, value: &str) -> Result<(), ApiError> {
    check_length(field, value, 1, 2048)?;
    let parsed =
        url::Url::parse(value).map_err(|_| ApiError::BadRequest(format!("{field} is not a URL")))?;
    if !matches!(parsed.scheme(), "http" | "https" | "ssh" | "git") {
        return Err(ApiError::BadRequest(format!(
            "{field} must use http, https, ssh, or git scheme"
        )));
    }
    Ok(())
}

pub fn check_branch_name(value: &str) -> Result<(), ApiError> {
    check_length("branch name", value, 1, 255)?;
    if value.contains("..") || value.contains('\0') {
        return Err(ApiError::BadRequest(
            "branch name must not contain '..' or null bytes".into(),
        ));
    }
    Ok(())
}

pub fn check_replicas(value: i32) -> Result<(), ApiError> {
    if !(0..=100).contains(&value) {
        return Err(ApiError::BadRequest(
            "replicas must be between 0 and 100".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_slug() {
        assert!(check_slug("slug", "my-service-2").is_ok());
    }

    #[test]
    fn slug_rejects_uppercase() {
        assert!(check_slug("slug", "MyService").is_err());
    }

    #[test]
    fn slug_rejects_edge_hyphens() {
        assert!(check_slug("slug", "-svc").is_err());
        assert!(check_slug("slug", "svc-").is_err());
    }

    #[test]
    fn slug_rejects_too_long() {
        let long = "a".repeat(64);
        assert!(check_slug("slug", &long).is_err());
    }

    #[test]
    fn valid_sha() {
        assert!(check_git_sha("deadbeefcafe").is_ok());
        assert!(check_git_sha(&"a".repeat(40)).is_ok());
    }

    #[test]
    fn sha_rejects_short_and_nonhex() {
        assert!(check_git_sha("abc").is_err());
        assert!(check_git_sha("not-a-sha-at-all").is_err());
    }

    #[test]
    fn valid_repo_urls() {
        assert!(check_url("git_repo", "https://github.com/acme/api").is_ok());
        assert!(check_url("git_repo", "ssh://git@github.com/acme/api.git").is_ok());
    }

    #[test]
    fn url_rejects_garbage() {
        assert!(check_url("git_repo", "not a url").is_err());
        assert!(check_url("git_repo", "file:///etc/passwd").is_err());
    }

    #[test]
    fn branch_rejects_traversal() {
        assert!(check_branch_name("fea/../../etc").is_err());
    }

    #[test]
    fn replicas_bounds() {
        assert!(check_replicas(0).is_ok());
        assert!(check_replicas(100).is_ok());
        assert!(check_replicas(-1).is_err());
        assert!(check_replicas(101).is_err());
    }
}
