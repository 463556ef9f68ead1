use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Per-config apply bookkeeping reported back to the control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Unacknowledged = 1,
    Acknowledged = 2,
    Error = 3,
}

impl Serialize for ApplyState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Metadata for one configuration discovered in a poll response.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigMetadata {
    pub id: String,
    pub product_name: String,
    pub sha256_hash: String,
    pub length: u64,
    pub tuf_version: u64,
    pub apply_state: ApplyState,
    pub apply_error: Option<String>,
}

/// One pushed file, scoped to a single poll cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetFile {
    pub path: String,
    /// base64-encoded content
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetFileHash {
    pub algorithm: String,
    pub hash: String,
}

/// Hash record for a previously-applied target, echoed in the next request.
#[derive(Debug, Clone, Serialize)]
pub struct CachedTargetFile {
    pub path: String,
    pub length: u64,
    pub hashes: Vec<TargetFileHash>,
}

/// Body of one poll response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientGetConfigsResponse {
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub targets: Option<String>,
    #[serde(default)]
    pub target_files: Vec<TargetFile>,
    #[serde(default)]
    pub client_configs: Vec<String>,
}

/// Signed TUF-style targets envelope (base64 JSON in the response).
#[derive(Debug, Clone, Deserialize)]
pub struct SignedTargets {
    #[serde(default)]
    pub signatures: serde_json::Value,
    pub signed: TargetsSigned,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsSigned {
    #[serde(rename = "_type", default)]
    pub kind: String,
    #[serde(default)]
    pub custom: Option<TargetsCustom>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(default)]
    pub targets: HashMap<String, TargetDescription>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsCustom {
    #[serde(default)]
    pub opaque_backend_state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetDescription {
    #[serde(default)]
    pub custom: Option<TargetCustom>,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetCustom {
    #[serde(default)]
    pub v: u64,
}

impl TargetDescription {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }

    pub fn tuf_version(&self) -> u64 {
        self.custom.as_ref().map(|c| c.v).unwrap_or(0)
    }
}

/// Extract `(product, config id)` from a config path of the form
/// `datadog/<org>/<PRODUCT>/<id>/<name>` or `employee/<PRODUCT>/<id>/<name>`.
pub fn parse_config_path(path: &str) -> Option<(String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:datadog/\d+|employee)/([^/]+)/([^/]+)/[^/]+$")
            .expect("static config path pattern compiles")
    });
    let captures = re.captures(path)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_path_variants() {
        assert_eq!(
            parse_config_path("datadog/2/ASM_FEATURES/asm_features_activation/config"),
            Some((
                "ASM_FEATURES".to_string(),
                "asm_features_activation".to_string()
            ))
        );
        assert_eq!(
            parse_config_path("employee/ASM_DD/default/config"),
            Some(("ASM_DD".to_string(), "default".to_string()))
        );
        assert_eq!(parse_config_path("garbage/path"), None);
        assert_eq!(parse_config_path("datadog/x/ASM/id/config"), None);
    }

    #[test]
    fn test_apply_state_serializes_as_integer() {
        let state = serde_json::to_value(ApplyState::Error).unwrap();
        assert_eq!(state, serde_json::json!(3));
    }

    #[test]
    fn test_signed_targets_decoding() {
        let raw = serde_json::json!({
            "signatures": [{"keyid": "", "sig": ""}],
            "signed": {
                "_type": "targets",
                "custom": {"opaque_backend_state": "abc"},
                "expires": "2030-01-01T00:00:00Z",
                "spec_version": "1.0.0",
                "targets": {
                    "datadog/2/ASM_FEATURES/x/config": {
                        "custom": {"v": 7},
                        "hashes": {"sha256": "deadbeef"},
                        "length": 24
                    }
                },
                "version": 3
            }
        });
        let parsed: SignedTargets = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.signed.version, 3);
        let target = &parsed.signed.targets["datadog/2/ASM_FEATURES/x/config"];
        assert_eq!(target.sha256(), Some("deadbeef"));
        assert_eq!(target.tuf_version(), 7);
    }
}
