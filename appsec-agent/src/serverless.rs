use crate::config::ServerlessConfig;
use tracing::{debug, error, info};

/// Fallback mini-agent location used when no path is configured.
const DEFAULT_MINI_AGENT_PATH: &str =
    "/workspace/serverless-agent/datadog-serverless-trace-mini-agent";

/// True when running inside a GCP cloud function environment, either the
/// newer runtime (K_SERVICE/FUNCTION_TARGET) or the legacy one
/// (FUNCTION_NAME/GCP_PROJECT).
pub fn in_gcp_function() -> bool {
    let has = |k: &str| std::env::var_os(k).is_some();
    (has("K_SERVICE") && has("FUNCTION_TARGET")) || (has("FUNCTION_NAME") && has("GCP_PROJECT"))
}

/// Spawn the external mini-agent process when a serverless environment is
/// detected. Best effort only: spawn failures are logged, never propagated.
pub fn maybe_start_mini_agent(config: &ServerlessConfig) {
    if !in_gcp_function() {
        debug!("Not a serverless environment, mini-agent not started");
        return;
    }

    let path = config
        .mini_agent_path
        .as_deref()
        .unwrap_or(DEFAULT_MINI_AGENT_PATH);

    match std::process::Command::new(path).spawn() {
        Ok(child) => info!(path = %path, pid = child.id(), "Started serverless mini-agent"),
        Err(e) => error!(path = %path, error = %e, "Error spawning serverless mini-agent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_serverless_without_env() {
        std::env::remove_var("K_SERVICE");
        std::env::remove_var("FUNCTION_TARGET");
        std::env::remove_var("FUNCTION_NAME");
        std::env::remove_var("GCP_PROJECT");
        assert!(!in_gcp_function());
    }
}
