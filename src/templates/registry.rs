//! The template registry: discovery + semver resolution + compatibility
//! gating + cached acquisition, wired together behind one `acquire()` call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::errors::FlyError;
use crate::templates::cache::{CacheEntry, Lookup, TemplateCache};
use crate::templates::descriptor::TemplateDescriptor;
use crate::templates::discovery;
use crate::templates::semver_range::Constraint;
use crate::FlydConfig;

/// A pluggable "how to fetch a template from upstream" strategy. The
/// acquisition algorithm (`acquire`) is source-agnostic: it only knows how to
/// interpret the cache state machine and fall back on fetch failure.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, name: &str, version: Option<&semver::Version>) -> Result<(TemplateDescriptor, Vec<u8>), FlyError>;
}

/// Fetches templates from a real upstream registry over HTTP.
pub struct HttpTemplateSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTemplateSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch(&self, name: &str, version: Option<&semver::Version>) -> Result<(TemplateDescriptor, Vec<u8>), FlyError> {
        let url = match version {
            Some(v) => format!("{}/templates/{name}/{v}", self.base_url),
            None => format!("{}/templates/{name}/latest", self.base_url),
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FlyError::NetworkRetryable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FlyError::NetworkRetryable(format!(
                "upstream returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FlyError::NetworkFatal(e.to_string()))?;
        let descriptor: TemplateDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| FlyError::NetworkFatal(format!("malformed upstream response: {e}")))?;
        Ok((descriptor, bytes.to_vec()))
    }
}

/// Fetches templates from a second on-disk directory — an offline mirror, or
/// a fixture root in tests — implementing the same `TemplateSource` trait as
/// the HTTP source so `acquire()` never special-cases it.
pub struct LocalTemplateSource {
    mirror_root: PathBuf,
}

impl LocalTemplateSource {
    pub fn new(mirror_root: PathBuf) -> Self {
        Self { mirror_root }
    }
}

#[async_trait]
impl TemplateSource for LocalTemplateSource {
    async fn fetch(&self, name: &str, version: Option<&semver::Version>) -> Result<(TemplateDescriptor, Vec<u8>), FlyError> {
        let versions = discovery::discover_versions(&self.mirror_root, name);
        let chosen = match version {
            Some(v) => versions.iter().find(|d| &d.version == v),
            None => versions.iter().max_by_key(|d| d.version.clone()),
        }
        .ok_or_else(|| FlyError::NotFound(format!("template '{name}' not found in mirror")))?;

        let descriptor = discovery::load_descriptor(&chosen.descriptor_path)?;
        let blob = std::fs::read(&chosen.descriptor_path)
            .map_err(|e| FlyError::NetworkFatal(format!("cannot read mirror template: {e}")))?;
        Ok((descriptor, blob))
    }
}

/// The structured report produced by the compatibility gate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatibilityReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Evaluate a template's declared bounds against the running environment.
pub fn check_compatibility(template: &TemplateDescriptor, config: &FlydConfig) -> CompatibilityReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if let Some(min) = &template.cli_min_version {
        if &config.cli_version < min {
            errors.push(format!(
                "template requires CLI >= {min}, current CLI is {}",
                config.cli_version
            ));
        }
    }
    if let Some(max) = &template.cli_max_version {
        if &config.cli_version > max {
            errors.push(format!(
                "template requires CLI <= {max}, current CLI is {}",
                config.cli_version
            ));
        }
    }
    if config.flutter_version < template.min_flutter_sdk {
        errors.push(format!(
            "template requires Flutter SDK >= {}, current Flutter SDK is {}",
            template.min_flutter_sdk, config.flutter_version
        ));
    }
    if config.dart_version < template.min_dart_sdk {
        errors.push(format!(
            "template requires Dart SDK >= {}, current Dart SDK is {}",
            template.min_dart_sdk, config.dart_version
        ));
    }

    let now = chrono::Utc::now();
    if let Some(eol) = template.eol_date {
        if now >= eol {
            errors.push(format!("template reached end-of-life on {}", eol.to_rfc3339()));
        } else if eol - now <= chrono::Duration::days(60) {
            warnings.push(format!("template approaches end-of-life on {}", eol.to_rfc3339()));
        }
    }
    if template.deprecated {
        let date = template
            .deprecation_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "unknown date".to_string());
        warnings.push(format!("template deprecated since {date}"));
    }

    CompatibilityReport { ok: errors.is_empty(), errors, warnings }
}

/// Strip `..` and path separators from a user-supplied template name; an
/// empty result after stripping is an error.
pub fn sanitize_name(name: &str) -> Result<String, FlyError> {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\')
        .collect::<String>()
        .replace("..", "");
    if cleaned.is_empty() {
        return Err(FlyError::invalid_params("template name must not be empty"));
    }
    Ok(cleaned)
}

/// Options controlling a single `acquire()` call.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub version: Option<semver::Version>,
    pub force_refresh: bool,
}

/// What `acquire()` returned, including whether it was served stale.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub template: TemplateDescriptor,
    pub stale: bool,
}

/// The versioned template registry: on-disk discovery, semver resolution,
/// compatibility gating, and a cached, singleflight-coalesced acquisition
/// path.
pub struct TemplateRegistry {
    templates_root: PathBuf,
    config: Arc<FlydConfig>,
    cache: TemplateCache,
    source: Arc<dyn TemplateSource>,
    singleflight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TemplateRegistry {
    pub fn new(config: Arc<FlydConfig>, source: Arc<dyn TemplateSource>) -> Self {
        let cache = TemplateCache::new(
            config.cache_root.clone(),
            config.template_ttl,
            config.cache_max_size_bytes,
        );
        Self {
            templates_root: config.templates_root.clone(),
            config,
            cache,
            source,
            singleflight: DashMap::new(),
        }
    }

    /// Build a registry for tests: an HTTP source pointed at the configured
    /// `template_registry_url` is harmless since tests that exercise
    /// `acquire()` against it supply a `LocalTemplateSource` or a mock
    /// server explicitly.
    pub fn new_for_tests(config: Arc<FlydConfig>) -> Self {
        let source: Arc<dyn TemplateSource> = Arc::new(HttpTemplateSource::new(config.template_registry_url.clone()));
        Self::new(config, source)
    }

    pub fn discover_versions(&self, name: &str) -> Result<Vec<semver::Version>, FlyError> {
        let name = sanitize_name(name)?;
        let mut versions: Vec<semver::Version> = discovery::discover_versions(&self.templates_root, &name)
            .into_iter()
            .map(|d| d.version)
            .collect();
        versions.sort();
        versions.reverse();
        Ok(versions)
    }

    pub fn get_template_version(&self, name: &str, version: &semver::Version) -> Result<TemplateDescriptor, FlyError> {
        let name = sanitize_name(name)?;
        let candidates = [
            self.templates_root.join(&name).join("versions").join(version.to_string()).join("template.yaml"),
            self.templates_root.join(format!("{name}@{version}")).join("template.yaml"),
            self.templates_root.join(&name).join("template.yaml"),
        ];
        for (i, path) in candidates.iter().enumerate() {
            if !path.is_file() {
                continue;
            }
            // The bare `<name>/template.yaml` form only counts if its
            // declared version actually matches the one being asked for.
            if i == 2 {
                let Ok(descriptor) = discovery::load_descriptor(path) else { continue };
                if &descriptor.version == version {
                    return Ok(descriptor);
                }
                continue;
            }
            return discovery::load_descriptor(path);
        }
        Err(FlyError::NotFound(format!("template '{name}' version {version} not found")))
    }

    pub fn versions_in_range(&self, name: &str, constraint_str: &str) -> Result<Vec<semver::Version>, FlyError> {
        let constraint = Constraint::parse(constraint_str)?;
        let mut versions: Vec<semver::Version> = self
            .discover_versions(name)?
            .into_iter()
            .filter(|v| constraint.matches(v))
            .collect();
        versions.sort();
        versions.reverse();
        Ok(versions)
    }

    pub fn next_version(&self, name: &str, current: &semver::Version) -> Result<Option<semver::Version>, FlyError> {
        Ok(self
            .discover_versions(name)?
            .into_iter()
            .filter(|v| v > current)
            .min())
    }

    pub fn previous_version(&self, name: &str, current: &semver::Version) -> Result<Option<semver::Version>, FlyError> {
        Ok(self
            .discover_versions(name)?
            .into_iter()
            .filter(|v| v < current)
            .max())
    }

    pub fn check_compatibility(&self, template: &TemplateDescriptor) -> CompatibilityReport {
        check_compatibility(template, &self.config)
    }

    /// The canonical acquisition routine from the spec, including singleflight
    /// coalescing of concurrent callers for the same cache key.
    pub async fn acquire(&self, name: &str, opts: AcquireOptions) -> Result<Acquired, FlyError> {
        let name = sanitize_name(name)?;
        let key = match &opts.version {
            Some(v) => format!("{name}@{v}"),
            None => format!("{name}@latest"),
        };

        let gate = self
            .singleflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _permit = gate.lock().await;

        if !opts.force_refresh {
            if let Lookup::Hit(entry) = self.cache.lookup(&key) {
                return Ok(Acquired { template: entry.template, stale: false });
            }
        }

        if !self.config.offline {
            match self.source.fetch(&name, opts.version.as_ref()).await {
                Ok((template, blob)) => {
                    let entry = CacheEntry::new(template.clone(), blob, self.cache.default_ttl());
                    if let Err(e) = self.cache.put(entry) {
                        warn!(name = %name, error = %e, "failed to persist template cache entry");
                    }
                    return Ok(Acquired { template, stale: false });
                }
                Err(e) => {
                    if let Some(entry) = self.any_cached_entry(&name) {
                        info!(name = %name, error = %e, "upstream fetch failed — serving stale cache entry");
                        return Ok(Acquired { template: entry.template, stale: true });
                    }
                    return Err(FlyError::NetworkFatal(format!(
                        "download failed and no cache available for '{name}': {e}"
                    )));
                }
            }
        }

        // Offline: expired entries are acceptable; any miss is terminal.
        if let Some(entry) = self.any_cached_entry(&name) {
            let stale = !entry.is_valid(chrono::Utc::now());
            if stale {
                warn!(name = %name, "serving expired template from cache in offline mode");
            }
            return Ok(Acquired { template: entry.template, stale });
        }

        Err(FlyError::OfflineUnavailable(format!(
            "offline and no cache entry for '{name}'"
        )))
    }

    fn any_cached_entry(&self, name: &str) -> Option<CacheEntry> {
        let keys = crate::templates::cache::known_keys(&self.config.cache_root);
        self.cache.any_entry_for(name, &keys)
    }

    pub fn cleanup_cache(&self) -> std::io::Result<()> {
        self.cache.cleanup()
    }

    pub fn cache_meta(&self) -> Option<crate::templates::cache::CacheMeta> {
        self.cache.read_meta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, version: &str) -> TemplateDescriptor {
        TemplateDescriptor {
            name: name.to_string(),
            version: semver::Version::parse(version).unwrap(),
            description: "test".into(),
            min_flutter_sdk: semver::Version::new(3, 0, 0),
            min_dart_sdk: semver::Version::new(3, 0, 0),
            cli_min_version: None,
            cli_max_version: None,
            features: vec![],
            packages: vec![],
            deprecated: false,
            deprecation_date: None,
            eol_date: None,
            variables_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn base_config(dir: &std::path::Path) -> FlydConfig {
        FlydConfig::load(dir.to_path_buf()).unwrap()
    }

    #[test]
    fn sanitize_name_strips_traversal_and_separators() {
        assert_eq!(sanitize_name("a/../b").unwrap(), "ab");
        assert_eq!(sanitize_name("plain").unwrap(), "plain");
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("").is_err());
    }

    #[test]
    fn compatibility_flags_flutter_sdk_violation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.flutter_version = semver::Version::new(3, 10, 0);
        let mut template = descriptor("demo", "1.0.0");
        template.min_flutter_sdk = semver::Version::new(3, 12, 0);

        let report = check_compatibility(&template, &config);
        assert!(!report.ok);
        assert!(report.errors.iter().any(|e| e.contains("Flutter SDK")));
    }

    #[test]
    fn compatibility_warns_on_approaching_eol() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path());
        let mut template = descriptor("demo", "1.0.0");
        template.eol_date = Some(chrono::Utc::now() + chrono::Duration::days(30));

        let report = check_compatibility(&template, &config);
        assert!(report.ok);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn compatibility_errors_on_past_eol() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path());
        let mut template = descriptor("demo", "1.0.0");
        template.eol_date = Some(chrono::Utc::now() - chrono::Duration::days(1));

        let report = check_compatibility(&template, &config);
        assert!(!report.ok);
    }

    struct CountingSource {
        calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
        template: TemplateDescriptor,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl TemplateSource for CountingSource {
        async fn fetch(&self, _name: &str, _version: Option<&semver::Version>) -> Result<(TemplateDescriptor, Vec<u8>), FlyError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok((self.template.clone(), b"blob".to_vec()))
        }
    }

    #[tokio::test]
    async fn acquire_hits_cache_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(dir.path()));
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let source = Arc::new(CountingSource {
            calls: calls.clone(),
            template: descriptor("riverpod", "2.1.0"),
            delay: std::time::Duration::ZERO,
        });
        let registry = TemplateRegistry::new(config, source);

        let first = registry.acquire("riverpod", AcquireOptions { version: Some(semver::Version::parse("2.1.0").unwrap()), force_refresh: false }).await.unwrap();
        let second = registry.acquire("riverpod", AcquireOptions { version: Some(semver::Version::parse("2.1.0").unwrap()), force_refresh: false }).await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.template.version, second.template.version);
        assert!(!second.stale);
    }

    #[tokio::test]
    async fn singleflight_coalesces_concurrent_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(dir.path()));
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let source = Arc::new(CountingSource {
            calls: calls.clone(),
            template: descriptor("x", "1.0.0"),
            delay: std::time::Duration::from_millis(50),
        });
        let registry = Arc::new(TemplateRegistry::new(config, source));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .acquire("x", AcquireOptions { version: Some(semver::Version::parse("1.0.0").unwrap()), force_refresh: false })
                    .await
                    .unwrap()
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.template.version == semver::Version::parse("1.0.0").unwrap()));
    }

    struct FailingSource;

    #[async_trait]
    impl TemplateSource for FailingSource {
        async fn fetch(&self, _name: &str, _version: Option<&semver::Version>) -> Result<(TemplateDescriptor, Vec<u8>), FlyError> {
            Err(FlyError::NetworkRetryable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn offline_hit_serves_cache_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(dir.path()));
        let registry = TemplateRegistry::new(config.clone(), Arc::new(FailingSource));

        let entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        registry.cache.put(entry).unwrap();

        let mut offline_config = (*config).clone();
        offline_config.offline = true;
        let offline_registry = TemplateRegistry::new(Arc::new(offline_config), Arc::new(FailingSource));
        let acquired = offline_registry
            .acquire("riverpod", AcquireOptions { version: Some(semver::Version::parse("2.1.0").unwrap()), force_refresh: false })
            .await
            .unwrap();
        assert!(!acquired.stale);
    }

    #[tokio::test]
    async fn expired_entry_served_stale_in_offline_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.offline = true;
        let config = Arc::new(config);
        let registry = TemplateRegistry::new(config.clone(), Arc::new(FailingSource));

        let mut entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        entry.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        registry.cache.put(entry).unwrap();

        let acquired = registry
            .acquire("riverpod", AcquireOptions { version: Some(semver::Version::parse("2.1.0").unwrap()), force_refresh: false })
            .await
            .unwrap();
        assert!(acquired.stale);
    }

    #[tokio::test]
    async fn network_failure_falls_back_to_stale_cache_when_online() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(dir.path()));
        let registry = TemplateRegistry::new(config, Arc::new(FailingSource));

        let entry = CacheEntry::new(descriptor("riverpod", "2.1.0"), b"blob".to_vec(), chrono::Duration::hours(1));
        registry.cache.put(entry).unwrap();

        let acquired = registry
            .acquire("riverpod", AcquireOptions { version: Some(semver::Version::parse("2.1.0").unwrap()), force_refresh: false })
            .await
            .unwrap();
        assert!(acquired.stale);
    }

    #[tokio::test]
    async fn offline_miss_is_terminal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.offline = true;
        let registry = TemplateRegistry::new(Arc::new(config), Arc::new(FailingSource));

        let result = registry
            .acquire("nonexistent", AcquireOptions { version: Some(semver::Version::parse("1.0.0").unwrap()), force_refresh: false })
            .await;
        assert!(matches!(result, Err(FlyError::OfflineUnavailable(_))));
    }

    #[tokio::test]
    async fn download_failure_with_no_cache_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(base_config(dir.path()));
        let registry = TemplateRegistry::new(config, Arc::new(FailingSource));

        let result = registry
            .acquire("never-cached", AcquireOptions { version: Some(semver::Version::parse("1.0.0").unwrap()), force_refresh: false })
            .await;
        assert!(matches!(result, Err(FlyError::NetworkFatal(_))));
    }
}
