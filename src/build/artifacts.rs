use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::store::releases::Release;
use crate::store::services::Service;

/// Provenance artifacts recorded on the ready transition. URIs point into the
/// S3-compatible artifact store.
pub struct Artifacts {
    pub sbom_uri: String,
    pub signature_uri: String,
}

pub fn sbom_path(release_id: Uuid) -> String {
    format!("sboms/{release_id}.cdx.json")
}

pub fn signature_path(release_id: Uuid) -> String {
    format!("signatures/{release_id}.json")
}

pub fn build_log_path(release_id: Uuid) -> String {
    format!("logs/builds/{release_id}.log")
}

/// Write SBOM and image signature for a built release, returning their URIs.
#[tracing::instrument(skip_all, fields(release_id = %release.id), err)]
pub async fn record(
    store: &opendal::Operator,
    bucket: &str,
    signing_key: &str,
    service: &Service,
    release: &Release,
    image_uri: &str,
    image_digest: &str,
) -> anyhow::Result<Artifacts> {
    let sbom = sbom_document(service, release, image_uri, image_digest);
    let sbom_path = sbom_path(release.id);
    store
        .write(&sbom_path, serde_json::to_vec(&sbom)?)
        .await?;

    let signature = signature_document(signing_key, image_digest);
    let signature_path = signature_path(release.id);
    store
        .write(&signature_path, serde_json::to_vec(&signature)?)
        .await?;

    Ok(Artifacts {
        sbom_uri: format!("s3://{bucket}/{sbom_path}"),
        signature_uri: format!("s3://{bucket}/{signature_path}"),
    })
}

/// Minimal CycloneDX document tying the image back to its source commit.
fn sbom_document(
    service: &Service,
    release: &Release,
    image_uri: &str,
    image_digest: &str,
) -> serde_json::Value {
    serde_json::json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.5",
        "serialNumber": format!("urn:uuid:{}", release.id),
        "version": 1,
        "metadata": {
            "timestamp": Utc::now().to_rfc3339(),
            "component": {
                "type": "container",
                "name": service.name,
                "version": format!("v{}", release.version),
                "purl": format!("pkg:oci/{}@{}", service.name, image_digest),
            },
            "properties": [
                {"name": "enclii:git_sha", "value": release.git_sha},
                {"name": "enclii:branch", "value": release.branch},
                {"name": "enclii:image", "value": image_uri},
            ],
        },
    })
}

/// HMAC-SHA256 signature over the image digest.
fn signature_document(signing_key: &str, image_digest: &str) -> serde_json::Value {
    serde_json::json!({
        "digest": image_digest,
        "algorithm": "hmac-sha256",
        "signature": sign_digest(signing_key, image_digest),
        "signed_at": Utc::now().to_rfc3339(),
    })
}

pub fn sign_digest(signing_key: &str, image_digest: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key size");
    mac.update(image_digest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Extract the pushed image digest from builder output. Builders print the
/// digest on push; the last `sha256:<hex>` occurrence wins. Falls back to a
/// digest of the image URI so the signature chain never dangles.
pub fn extract_image_digest(build_log: &str, image_uri: &str) -> String {
    let mut last: Option<&str> = None;
    for (idx, _) in build_log.match_indices("sha256:") {
        let rest = &build_log[idx + 7..];
        let hex_len = rest.chars().take_while(char::is_ascii_hexdigit).count();
        if hex_len >= 64 {
            last = Some(&build_log[idx..idx + 7 + 64]);
        }
    }

    last.map(ToOwned::to_owned).unwrap_or_else(|| {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(image_uri.as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_extracted_from_log() {
        let digest = "sha256:".to_owned() + &"ab".repeat(32);
        let log = format!("pushing image\n{digest} pushed to registry\ndone");
        assert_eq!(extract_image_digest(&log, "registry/app:v1"), digest);
    }

    #[test]
    fn last_digest_wins() {
        let d1 = "sha256:".to_owned() + &"11".repeat(32);
        let d2 = "sha256:".to_owned() + &"22".repeat(32);
        let log = format!("cache {d1}\npushed {d2}");
        assert_eq!(extract_image_digest(&log, "x"), d2);
    }

    #[test]
    fn short_hex_ignored() {
        let log = "layer sha256:abcd1234 cached";
        let digest = extract_image_digest(log, "registry/app:v1");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
        assert!(!digest.contains("abcd1234 "));
    }

    #[test]
    fn fallback_digest_is_stable() {
        let a = extract_image_digest("", "registry/app:v1");
        let b = extract_image_digest("no digests here", "registry/app:v1");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_is_deterministic_per_key() {
        let digest = "sha256:abc";
        assert_eq!(sign_digest("k1", digest), sign_digest("k1", digest));
        assert_ne!(sign_digest("k1", digest), sign_digest("k2", digest));
    }
}
