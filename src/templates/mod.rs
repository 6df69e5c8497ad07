//! The semver-aware template registry and its cache tier.
//!
//! `discovery` finds versioned templates on disk, `descriptor` validates the
//! `template.yaml` shape, `semver_range` resolves version constraints,
//! `cache` persists fetched artifacts with TTL/corruption/offline handling,
//! and `registry` ties all four into the `acquire()` entry point the MCP
//! tools call.

pub mod cache;
pub mod descriptor;
pub mod discovery;
pub mod registry;
pub mod semver_range;
