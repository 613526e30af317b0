//! Configuration model for trellis.
//!
//! A trellis instance is driven by one JSON document declaring global
//! options and a list of index definitions. This crate loads that
//! document into a typed [`Configuration`]:
//!
//! - [`Settings`]: global tuning knobs with defaults
//! - [`IndexDefinition`]: regular and composite index projections,
//!   with composite sub-indexes expanded at load time
//! - [`PathCache`]: the precomputed predicate/type dependency tables
//!   consumed by the delta processor
//!
//! Validation is fatal and aggregated: every problem found in the
//! document is collected into a single [`ConfigError::Invalid`] report.

mod definition;
mod error;
mod paths;

pub use definition::{
    path_to_sparql, CompositeIndex, IndexDefinition, IndexKind, PathElement, PropertyDefinition,
    PropertyKind, RegularIndex, SubIndex,
};
pub use error::{ConfigError, Result};
pub use paths::{PathCache, PathOccurrence};

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use trellis_auth::{AccessGroup, AccessScope};

fn default_batch_size() -> usize {
    100
}

fn default_number_of_threads() -> usize {
    1
}

fn default_attachment_path_base() -> String {
    "/share/".to_string()
}

fn default_maximum_file_size() -> u64 {
    10_000_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    /// 0 means unbounded.
    #[serde(default)]
    max_batches: usize,
    #[serde(default)]
    persist_indexes: bool,
    #[serde(default = "default_true")]
    automatic_index_updates: bool,
    #[serde(default)]
    enable_raw_dsl_endpoint: bool,
    #[serde(default = "default_attachment_path_base")]
    attachment_path_base: String,
    #[serde(default = "default_maximum_file_size")]
    maximum_file_size: u64,
    #[serde(default)]
    common_terms_cutoff_frequency: Option<f64>,
    #[serde(default)]
    update_wait_interval_minutes: u64,
    #[serde(default = "default_number_of_threads")]
    number_of_threads: usize,
    #[serde(default)]
    eager_indexing_groups: Vec<Vec<AccessGroup>>,
    #[serde(default)]
    ignored_allowed_groups: Vec<AccessGroup>,
    #[serde(default)]
    default_settings: Option<Value>,
    #[serde(default)]
    types: Vec<Value>,
}

/// Global options, with defaults applied.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Resources per bulk-indexing batch.
    pub batch_size: usize,
    /// Cap on the number of batches per index build; 0 is unbounded.
    pub max_batches: usize,
    /// Keep index metadata across restarts.
    pub persist_indexes: bool,
    /// Apply incoming deltas to the indexes automatically.
    pub automatic_index_updates: bool,
    /// Expose the raw query DSL passthrough endpoint.
    pub enable_raw_dsl_endpoint: bool,
    /// Local directory that `share://` attachment IRIs resolve under.
    pub attachment_path_base: PathBuf,
    /// Attachments larger than this many bytes are not extracted.
    pub maximum_file_size: u64,
    /// Cutoff frequency handed to the backend for common-terms queries.
    pub common_terms_cutoff_frequency: Option<f64>,
    /// Debounce window applied before a queued update runs.
    pub update_wait_interval: Duration,
    /// Parallel workers for bulk indexing.
    pub number_of_threads: usize,
    /// Group tuples to pre-index at startup.
    pub eager_indexing_groups: Vec<AccessScope>,
    /// Groups stripped from every caller scope before index selection.
    pub ignored_allowed_groups: Vec<AccessGroup>,
    /// Backend settings applied to indexes that declare none.
    pub default_settings: Option<Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batches: 0,
            persist_indexes: false,
            automatic_index_updates: true,
            enable_raw_dsl_endpoint: false,
            attachment_path_base: PathBuf::from(default_attachment_path_base()),
            maximum_file_size: default_maximum_file_size(),
            common_terms_cutoff_frequency: None,
            update_wait_interval: Duration::ZERO,
            number_of_threads: default_number_of_threads(),
            eager_indexing_groups: Vec::new(),
            ignored_allowed_groups: Vec::new(),
            default_settings: None,
        }
    }
}

/// A loaded and validated configuration.
#[derive(Debug)]
pub struct Configuration {
    pub settings: Settings,
    definitions: Vec<IndexDefinition>,
    by_name: HashMap<String, usize>,
    path_cache: PathCache,
}

impl Configuration {
    /// Load from a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Load from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load from a parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawConfiguration = serde_json::from_value(value)?;
        let mut errors = Vec::new();

        let definitions = definition::lower_definitions(&raw.types, &mut errors);

        let mut eager_indexing_groups = Vec::with_capacity(raw.eager_indexing_groups.len());
        for (i, tuple) in raw.eager_indexing_groups.iter().enumerate() {
            let scope = AccessScope::new(tuple.clone());
            if scope.has_wildcard() && scope.len() > 1 {
                errors.push(format!(
                    "eager_indexing_groups[{i}]: wildcard group cannot be combined with other access rights"
                ));
                continue;
            }
            eager_indexing_groups.push(scope);
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let by_name = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        let path_cache = PathCache::build(&definitions);

        Ok(Self {
            settings: Settings {
                batch_size: raw.batch_size.max(1),
                max_batches: raw.max_batches,
                persist_indexes: raw.persist_indexes,
                automatic_index_updates: raw.automatic_index_updates,
                enable_raw_dsl_endpoint: raw.enable_raw_dsl_endpoint,
                attachment_path_base: PathBuf::from(raw.attachment_path_base),
                maximum_file_size: raw.maximum_file_size,
                common_terms_cutoff_frequency: raw.common_terms_cutoff_frequency,
                update_wait_interval: Duration::from_secs(raw.update_wait_interval_minutes * 60),
                number_of_threads: raw.number_of_threads.max(1),
                eager_indexing_groups,
                ignored_allowed_groups: raw.ignored_allowed_groups,
                default_settings: raw.default_settings,
            },
            definitions,
            by_name,
            path_cache,
        })
    }

    /// All index definitions, in declaration order.
    pub fn definitions(&self) -> &[IndexDefinition] {
        &self.definitions
    }

    /// Look up a definition by type name.
    pub fn definition(&self, type_name: &str) -> Option<&IndexDefinition> {
        self.by_name.get(type_name).map(|&i| &self.definitions[i])
    }

    /// Configured type names, in declaration order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.name.as_str())
    }

    /// The precomputed path dependency tables.
    pub fn path_cache(&self) -> &PathCache {
        &self.path_cache
    }

    /// Strip the configured ignored groups from a caller scope.
    pub fn effective_scope(&self, scope: &AccessScope) -> AccessScope {
        scope.without(&self.settings.ignored_allowed_groups)
    }
}
