//! Layered configuration for `flyd`.
//!
//! Priority (highest to lowest): environment variable > `flyd.toml` in the
//! workspace root > built-in default. This mirrors the config layering used
//! elsewhere in the Fly daemon family (CLI/env over TOML over default).

use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_GLOBAL_CONCURRENCY: usize = 10;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RESOURCE_BYTES: usize = 1024 * 1024;
const DEFAULT_LOG_RING_CAP_BYTES: usize = 1024 * 1024;
const DEFAULT_TEMPLATE_TTL_SECS: i64 = 6 * 60 * 60;
const DEFAULT_CACHE_MAX_SIZE_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_HEALTH_CONCURRENCY: usize = 10;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEALTH_TTL_SECS: i64 = 24 * 60 * 60;

/// `{workspace_root}/flyd.toml` — every field optional, all overridable by env.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    max_message_bytes: Option<usize>,
    global_concurrency: Option<usize>,
    tool_timeout_secs: Option<u64>,
    admission_timeout_secs: Option<u64>,
    max_resource_bytes: Option<usize>,
    log_ring_cap_bytes: Option<usize>,
    templates_root: Option<PathBuf>,
    cache_root: Option<PathBuf>,
    template_ttl_secs: Option<i64>,
    cache_max_size_bytes: Option<u64>,
    health_concurrency: Option<usize>,
    health_timeout_secs: Option<u64>,
    health_ttl_secs: Option<i64>,
    pub_dev_base_url: Option<String>,
    template_registry_url: Option<String>,
    cli_version: Option<String>,
    flutter_version: Option<String>,
    dart_version: Option<String>,
    offline: Option<bool>,
}

fn load_toml(workspace_root: &Path) -> TomlConfig {
    let path = workspace_root.join("flyd.toml");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return TomlConfig::default();
    };
    match toml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(path = %path.display(), err = %e, "failed to parse flyd.toml — using defaults");
            TomlConfig::default()
        }
    }
}

/// Resolved configuration used by the dispatcher, resource providers, and
/// the template/health subsystems.
#[derive(Debug, Clone)]
pub struct FlydConfig {
    pub workspace_root: PathBuf,
    pub templates_root: PathBuf,
    pub cache_root: PathBuf,

    pub max_message_bytes: usize,
    pub global_concurrency: usize,
    pub tool_timeout: std::time::Duration,
    pub admission_timeout: std::time::Duration,
    pub max_resource_bytes: usize,
    pub log_ring_cap_bytes: usize,

    pub template_ttl: chrono::Duration,
    pub cache_max_size_bytes: u64,

    pub health_concurrency: usize,
    pub health_timeout: std::time::Duration,
    pub health_ttl: chrono::Duration,
    pub pub_dev_base_url: String,

    /// Upstream template registry, distinct from `pub_dev_base_url` — the
    /// template fetch API and the package-health API are different services.
    pub template_registry_url: String,

    /// Current toolchain versions, used by the template compatibility gate.
    pub cli_version: semver::Version,
    pub flutter_version: semver::Version,
    pub dart_version: semver::Version,

    /// When set, the template registry refuses all network fetches and
    /// serves expired cache entries with a `stale` flag instead of failing.
    pub offline: bool,
}

impl FlydConfig {
    /// Build config for a given workspace root, applying env overrides on
    /// top of `{workspace_root}/flyd.toml`, on top of built-in defaults.
    pub fn load(workspace_root: PathBuf) -> anyhow::Result<Self> {
        let toml = load_toml(&workspace_root);

        let env_usize = |key: &str| -> Option<usize> { std::env::var(key).ok()?.parse().ok() };
        let env_u64 = |key: &str| -> Option<u64> { std::env::var(key).ok()?.parse().ok() };
        let env_i64 = |key: &str| -> Option<i64> { std::env::var(key).ok()?.parse().ok() };
        let env_bool =
            |key: &str| -> Option<bool> { std::env::var(key).ok().map(|v| v == "1" || v == "true") };
        let env_path = |key: &str| -> Option<PathBuf> { std::env::var(key).ok().map(PathBuf::from) };

        let templates_root = env_path("FLY_TEMPLATES_ROOT")
            .or(toml.templates_root)
            .unwrap_or_else(|| workspace_root.join(".fly").join("templates"));
        let cache_root = env_path("FLY_CACHE_ROOT")
            .or(toml.cache_root)
            .unwrap_or_else(|| workspace_root.join(".fly").join("cache"));

        let cli_version_str = std::env::var("FLY_CLI_VERSION")
            .ok()
            .or(toml.cli_version)
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        let flutter_version_str = std::env::var("FLY_FLUTTER_VERSION")
            .ok()
            .or(toml.flutter_version)
            .unwrap_or_else(|| "3.0.0".to_string());
        let dart_version_str = std::env::var("FLY_DART_VERSION")
            .ok()
            .or(toml.dart_version)
            .unwrap_or_else(|| "3.0.0".to_string());

        Ok(Self {
            workspace_root,
            templates_root,
            cache_root,

            max_message_bytes: env_usize("FLY_MAX_MESSAGE_BYTES")
                .or(toml.max_message_bytes)
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
            global_concurrency: env_usize("FLY_GLOBAL_CONCURRENCY")
                .or(toml.global_concurrency)
                .unwrap_or(DEFAULT_GLOBAL_CONCURRENCY),
            tool_timeout: std::time::Duration::from_secs(
                env_u64("FLY_TOOL_TIMEOUT_SECS")
                    .or(toml.tool_timeout_secs)
                    .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
            ),
            admission_timeout: std::time::Duration::from_secs(
                env_u64("FLY_ADMISSION_TIMEOUT_SECS")
                    .or(toml.admission_timeout_secs)
                    .unwrap_or(DEFAULT_ADMISSION_TIMEOUT_SECS),
            ),
            max_resource_bytes: env_usize("FLY_MAX_RESOURCE_BYTES")
                .or(toml.max_resource_bytes)
                .unwrap_or(DEFAULT_MAX_RESOURCE_BYTES),
            log_ring_cap_bytes: env_usize("FLY_LOG_RING_CAP_BYTES")
                .or(toml.log_ring_cap_bytes)
                .unwrap_or(DEFAULT_LOG_RING_CAP_BYTES),

            template_ttl: chrono::Duration::seconds(
                env_i64("FLY_TEMPLATE_TTL_SECS")
                    .or(toml.template_ttl_secs)
                    .unwrap_or(DEFAULT_TEMPLATE_TTL_SECS),
            ),
            cache_max_size_bytes: env_u64("FLY_CACHE_MAX_SIZE_BYTES")
                .or(toml.cache_max_size_bytes)
                .unwrap_or(DEFAULT_CACHE_MAX_SIZE_BYTES),

            health_concurrency: env_usize("FLY_HEALTH_CONCURRENCY")
                .or(toml.health_concurrency)
                .unwrap_or(DEFAULT_HEALTH_CONCURRENCY),
            health_timeout: std::time::Duration::from_secs(
                env_u64("FLY_HEALTH_TIMEOUT_SECS")
                    .or(toml.health_timeout_secs)
                    .unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
            ),
            health_ttl: chrono::Duration::seconds(
                env_i64("FLY_HEALTH_TTL_SECS")
                    .or(toml.health_ttl_secs)
                    .unwrap_or(DEFAULT_HEALTH_TTL_SECS),
            ),
            pub_dev_base_url: std::env::var("FLY_PUB_DEV_BASE_URL")
                .ok()
                .or(toml.pub_dev_base_url)
                .unwrap_or_else(|| "https://pub.dev".to_string()),
            template_registry_url: std::env::var("FLY_TEMPLATE_REGISTRY_URL")
                .ok()
                .or(toml.template_registry_url)
                .unwrap_or_else(|| "https://templates.fly.dev".to_string()),

            cli_version: semver::Version::parse(&cli_version_str)
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
            flutter_version: semver::Version::parse(&flutter_version_str)
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
            dart_version: semver::Version::parse(&dart_version_str)
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),

            offline: env_bool("FLY_OFFLINE").or(toml.offline).unwrap_or(false),
        })
    }

    /// Resolve the workspace root from `FLY_OUTPUT_DIR`, falling back to
    /// `PWD`, falling back to the process's current directory.
    pub fn resolve_workspace_root() -> PathBuf {
        std::env::var("FLY_OUTPUT_DIR")
            .ok()
            .or_else(|| std::env::var("PWD").ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_env_or_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FlydConfig::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(cfg.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(cfg.global_concurrency, DEFAULT_GLOBAL_CONCURRENCY);
        assert!(!cfg.offline);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flyd.toml"),
            "max_message_bytes = 4096\noffline = true\n",
        )
        .unwrap();
        let cfg = FlydConfig::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(cfg.max_message_bytes, 4096);
        assert!(cfg.offline);
    }
}
