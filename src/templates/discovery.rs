//! Multi-form template version discovery on disk.
//!
//! A template's available versions can be laid out four different ways
//! under `templates_root/<name>/`:
//!
//! 1. `template.yaml` directly in the template directory — single version.
//! 2. `versions.yaml` — a manifest listing multiple versions and their
//!    descriptor paths.
//! 3. Semver-named subdirectories: `1.0.0/template.yaml`, `1.1.0/template.yaml`.
//! 4. Sibling directories named `name@version`: `../bare_flutter_app@1.0.0/`.
//!
//! All four forms may coexist; discovery merges them, later forms winning on
//! an exact version collision (sibling directories are scanned last).

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::templates::descriptor::TemplateDescriptor;

#[derive(Debug, Clone)]
pub struct DiscoveredVersion {
    pub version: semver::Version,
    pub descriptor_path: PathBuf,
}

#[derive(Debug, serde::Deserialize)]
struct VersionsManifest {
    versions: Vec<VersionsManifestEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct VersionsManifestEntry {
    version: String,
    path: String,
}

/// Enumerate every version of `name` discoverable under `templates_root`.
pub fn discover_versions(templates_root: &Path, name: &str) -> Vec<DiscoveredVersion> {
    let mut found = std::collections::BTreeMap::new();
    let template_dir = templates_root.join(name);

    // Form 1: single template.yaml directly in the template directory.
    let direct = template_dir.join("template.yaml");
    if direct.is_file() {
        if let Some(version) = read_version_field(&direct) {
            found.insert(version.clone(), DiscoveredVersion { version, descriptor_path: direct });
        }
    }

    // Form 2: versions.yaml manifest.
    let manifest_path = template_dir.join("versions.yaml");
    if let Ok(contents) = std::fs::read_to_string(&manifest_path) {
        if let Ok(manifest) = serde_yaml::from_str::<VersionsManifest>(&contents) {
            for entry in manifest.versions {
                if let Ok(version) = semver::Version::parse(&entry.version) {
                    let descriptor_path = template_dir.join(&entry.path);
                    found.insert(version.clone(), DiscoveredVersion { version, descriptor_path });
                } else {
                    warn!(name, raw = %entry.version, "skipping unparseable template version");
                }
            }
        }
    }

    // Form 3: semver-named subdirectories.
    if let Ok(entries) = std::fs::read_dir(&template_dir) {
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(version) = semver::Version::parse(&dir_name) {
                let descriptor_path = entry.path().join("template.yaml");
                if descriptor_path.is_file() {
                    found.insert(version.clone(), DiscoveredVersion { version, descriptor_path });
                }
            } else {
                warn!(name, raw = %dir_name, "skipping unparseable template version");
            }
        }
    }

    // Form 4: sibling directories named `name@version`.
    if let Ok(entries) = std::fs::read_dir(templates_root) {
        let prefix = format!("{name}@");
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(version_str) = dir_name.strip_prefix(&prefix) {
                if let Ok(version) = semver::Version::parse(version_str) {
                    let descriptor_path = entry.path().join("template.yaml");
                    if descriptor_path.is_file() {
                        found.insert(version.clone(), DiscoveredVersion { version, descriptor_path });
                    }
                } else {
                    warn!(name, raw = %version_str, "skipping unparseable template version");
                }
            }
        }
    }

    found.into_values().collect()
}

fn read_version_field(descriptor_path: &Path) -> Option<semver::Version> {
    let contents = std::fs::read_to_string(descriptor_path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&contents).ok()?;
    let version_str = value.get("version")?.as_str()?;
    match semver::Version::parse(version_str) {
        Ok(version) => Some(version),
        Err(_) => {
            warn!(path = %descriptor_path.display(), raw = version_str, "skipping unparseable template version");
            None
        }
    }
}

/// Load and validate the descriptor at `descriptor_path`.
pub fn load_descriptor(descriptor_path: &Path) -> Result<TemplateDescriptor, crate::errors::FlyError> {
    let contents = std::fs::read_to_string(descriptor_path)
        .map_err(|e| crate::errors::FlyError::TemplateCorrupted(format!("cannot read {}: {e}", descriptor_path.display())))?;
    let descriptor: TemplateDescriptor = serde_yaml::from_str(&contents)
        .map_err(|e| crate::errors::FlyError::TemplateCorrupted(format!("cannot parse {}: {e}", descriptor_path.display())))?;
    descriptor
        .validate()
        .map_err(|e| crate::errors::FlyError::TemplateCorrupted(e.to_string()))?;
    Ok(descriptor)
}
