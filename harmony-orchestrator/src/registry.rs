// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loads service capability descriptors and selects the single service chain
//! able to perform an operation. Selection is a fixed pipeline of pure
//! predicate filters over (operation, context, candidates); a second
//! best-effort pass drops the optional subsetting predicates when no strict
//! match exists.

use harmony_common::model::CollectionId;
use harmony_common::operation::{AveragingKind, OperationDocument, StepOperation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

/// Warning attached to best-effort matches.
pub const BEST_EFFORT_WARNING: &str =
    "Data in output files may extend outside the spatial and temporal bounds you requested.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceRegistryFile {
    services: Vec<ServiceConfig>,
}

/// Declarative capabilities of one chain of containerized services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Operation document schema version this chain's services consume.
    pub data_operation_version: String,
    #[serde(default)]
    pub umm_s: Option<String>,
    #[serde(default)]
    pub default_sync: bool,
    #[serde(default)]
    pub concurrency: Option<i32>,
    #[serde(default)]
    pub granule_limit: Option<i32>,
    #[serde(default)]
    pub all_collections: bool,
    #[serde(default)]
    pub collections: Vec<CollectionCapability>,
    #[serde(default)]
    pub capabilities: ServiceCapabilities,
    pub steps: Vec<ServiceStep>,
}

impl ServiceConfig {
    fn supports_collection(&self, collection: &CollectionId, variables: &[String]) -> bool {
        if self.all_collections {
            return true;
        }
        match self.collections.iter().find(|c| c.id == collection.0) {
            None => false,
            Some(entry) => match &entry.variables {
                None => true,
                Some(allowed) => variables.iter().all(|v| allowed.contains(v)),
            },
        }
    }

    /// The smallest applicable granule limit for the operation, if any.
    pub fn granule_limit_for(&self, collections: &[&CollectionId]) -> Option<i32> {
        let per_collection = collections
            .iter()
            .filter_map(|collection| {
                self.collections
                    .iter()
                    .find(|c| &c.id == &collection.0)
                    .and_then(|c| c.granule_limit)
            })
            .min();
        match (self.granule_limit, per_collection) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCapability {
    pub id: String,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub granule_limit: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCapabilities {
    #[serde(default)]
    pub subsetting: SubsetCapabilities,
    #[serde(default)]
    pub output_formats: Vec<String>,
    #[serde(default)]
    pub reprojection: bool,
    #[serde(default)]
    pub concatenation: bool,
    #[serde(default)]
    pub extend: bool,
    #[serde(default)]
    pub averaging: AveragingCapabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubsetCapabilities {
    #[serde(default)]
    pub bbox: bool,
    #[serde(default)]
    pub shape: bool,
    #[serde(default)]
    pub temporal: bool,
    #[serde(default)]
    pub variable: bool,
    #[serde(default)]
    pub multiple_variable: bool,
    #[serde(default)]
    pub dimension: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AveragingCapabilities {
    #[serde(default)]
    pub time: bool,
    #[serde(default)]
    pub area: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStep {
    pub image: String,
    #[serde(default)]
    pub is_sequential: bool,
    #[serde(default)]
    pub is_batched: bool,
    #[serde(default)]
    pub max_batch_inputs: Option<i32>,
    #[serde(default)]
    pub max_batch_size_in_bytes: Option<i64>,
    #[serde(default)]
    pub operations: Vec<StepOperation>,
    #[serde(default)]
    pub conditional: Option<StepCondition>,
}

impl ServiceStep {
    pub fn is_query_step(&self) -> bool {
        self.image.contains("query-cmr")
    }
}

/// Predicate deciding whether a step participates in a particular job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(default)]
    pub exists: Vec<StepOperation>,
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default)]
    pub umm_c_native_format: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Service {service}: batching sizes must be positive integers no larger than {cap}")]
    InvalidBatchSize { service: String, cap: i32 },
    #[error("Service {service}: the CMR query step must be declared sequential")]
    QueryStepNotSequential { service: String },
    #[error(
        "Service {service}: either a collection allow-list or the all-collections flag is required"
    )]
    MissingCollections { service: String },
    #[error("Service {service}: a UMM-S id is required unless all-collections is set")]
    MissingUmmS { service: String },
    #[error("Unresolved environment variable {var} in service registry")]
    UnresolvedEnv { var: String },
    #[error("Failed to parse service registry: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to read service registry: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised when no service chain can perform an operation; carries a
/// user-presentable listing of what was asked for.
#[derive(Debug, thiserror::Error)]
#[error(
    "none of the currently available services can perform the requested combination of operations: [{}] on collections [{}]",
    requested_operations.join(", "),
    collections.join(", ")
)]
pub struct NoMatchingService {
    pub requested_operations: Vec<String>,
    pub collections: Vec<String>,
}

pub struct ChosenService<'a> {
    pub config: &'a ServiceConfig,
    pub warning: Option<String>,
}

/// Per-request inputs to chain selection that do not live on the operation
/// document itself.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// UMM-C native data format per collection concept id.
    pub collection_native_formats: HashMap<String, String>,
}

struct OperationFilter {
    name: &'static str,
    /// Dropped in the best-effort pass.
    optional: bool,
    applies: fn(&OperationDocument) -> bool,
    matches: fn(&OperationDocument, &ServiceConfig) -> bool,
}

static FILTERS: &[OperationFilter] = &[
    OperationFilter {
        name: "concatenation",
        optional: false,
        applies: |op| op.concatenate,
        matches: |_, s| s.capabilities.concatenation,
    },
    OperationFilter {
        name: "variable subsetting",
        optional: false,
        applies: |op| op.requires_variable_subset(),
        matches: |op, s| {
            let multiple = op.sources.iter().any(|src| src.variables.len() > 1);
            s.capabilities.subsetting.variable
                && (!multiple || s.capabilities.subsetting.multiple_variable)
        },
    },
    OperationFilter {
        name: "spatial subsetting",
        optional: true,
        applies: |op| op.requires_spatial_subset(),
        matches: |_, s| s.capabilities.subsetting.bbox,
    },
    OperationFilter {
        name: "temporal subsetting",
        optional: true,
        applies: |op| op.requires_temporal_subset(),
        matches: |_, s| s.capabilities.subsetting.temporal,
    },
    OperationFilter {
        name: "dimension subsetting",
        optional: false,
        applies: |op| op.requires_dimension_subset(),
        matches: |_, s| s.capabilities.subsetting.dimension,
    },
    OperationFilter {
        name: "reprojection",
        optional: false,
        applies: |op| op.requires_reprojection(),
        matches: |_, s| s.capabilities.reprojection,
    },
    OperationFilter {
        name: "extend",
        optional: false,
        applies: |op| op.requires_extend(),
        matches: |_, s| s.capabilities.extend,
    },
    OperationFilter {
        name: "area averaging",
        optional: false,
        applies: |op| op.average == Some(AveragingKind::Area),
        matches: |_, s| s.capabilities.averaging.area,
    },
    OperationFilter {
        name: "time averaging",
        optional: false,
        applies: |op| op.average == Some(AveragingKind::Time),
        matches: |_, s| s.capabilities.averaging.time,
    },
    OperationFilter {
        name: "shapefile subsetting",
        optional: true,
        applies: |op| op.requires_shape_subset(),
        matches: |_, s| s.capabilities.subsetting.shape,
    },
    OperationFilter {
        name: "reformatting",
        optional: false,
        applies: |op| op.format.mime.is_some(),
        matches: |op, s| match &op.format.mime {
            Some(mime) => s
                .capabilities
                .output_formats
                .iter()
                .any(|f| f.eq_ignore_ascii_case(mime)),
            None => true,
        },
    },
];

/// The loaded registry plus the mutable service-name -> image map refreshed
/// by deployment callbacks. Constructed once at startup and passed down;
/// there is no global instance.
pub struct ServiceRegistry {
    services: Vec<ServiceConfig>,
    image_map: RwLock<HashMap<String, String>>,
}

impl ServiceRegistry {
    pub fn load(
        yaml: &str,
        env: &HashMap<String, String>,
        max_granule_limit: i32,
    ) -> Result<ServiceRegistry, RegistryError> {
        let substituted = substitute_env(yaml, env)?;
        let mut file: ServiceRegistryFile = serde_yaml::from_str(&substituted)?;

        for service in &mut file.services {
            apply_collection_overrides(service, env);
            validate_service(service, max_granule_limit)?;
        }

        info!("Loaded {} service chains", file.services.len());
        Ok(ServiceRegistry {
            services: file.services,
            image_map: RwLock::new(image_map_from_env(env)),
        })
    }

    pub fn from_file(
        path: &Path,
        env: &HashMap<String, String>,
        max_granule_limit: i32,
    ) -> Result<ServiceRegistry, RegistryError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::load(&yaml, env, max_granule_limit)
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Effective image of a step: a `<SERVICE>_IMAGE` environment override
    /// or deployment-callback refresh wins over the descriptor value. The
    /// key is the image basename without tag (`harmonyservices/query-cmr:1`
    /// maps to `query-cmr`).
    pub fn image_for(&self, step: &ServiceStep) -> String {
        self.image_map
            .read()
            .unwrap()
            .get(&image_basename(&step.image))
            .cloned()
            .unwrap_or_else(|| step.image.clone())
    }

    pub fn update_image(&self, service_name: &str, image: &str) {
        self.image_map
            .write()
            .unwrap()
            .insert(service_name.to_string(), image.to_string());
    }

    /// Selects the single chain capable of performing the operation. Filters
    /// are applied in a fixed order; each filter that applies records the
    /// operation it consumed so that a failed selection can say what was
    /// requested.
    pub fn choose<'a>(
        &'a self,
        op: &OperationDocument,
        _context: &RequestContext,
    ) -> Result<ChosenService<'a>, NoMatchingService> {
        let mut requested: Vec<String> = Vec::new();

        let collection_matched: Vec<&ServiceConfig> = self
            .services
            .iter()
            .filter(|s| {
                op.sources.iter().all(|source| {
                    let variables: Vec<String> =
                        source.variables.iter().map(|v| v.name.clone()).collect();
                    s.supports_collection(&source.collection, &variables)
                })
            })
            .collect();

        let strict = run_filters(op, collection_matched.clone(), &mut requested, false);
        if let Some(config) = strict.into_iter().next() {
            return Ok(ChosenService {
                config,
                warning: None,
            });
        }

        // Best effort: only when at most one optional subsetting operation
        // was requested and the strict pass found nothing.
        let optional_requested = FILTERS
            .iter()
            .filter(|f| f.optional && (f.applies)(op))
            .count();
        if optional_requested == 1 {
            let mut ignored = Vec::new();
            let relaxed = run_filters(op, collection_matched, &mut ignored, true);
            if let Some(config) = relaxed.into_iter().next() {
                return Ok(ChosenService {
                    config,
                    warning: Some(BEST_EFFORT_WARNING.to_string()),
                });
            }
        }

        Err(NoMatchingService {
            requested_operations: requested,
            collections: op.sources.iter().map(|s| s.collection.0.clone()).collect(),
        })
    }
}

fn run_filters<'a>(
    op: &OperationDocument,
    mut candidates: Vec<&'a ServiceConfig>,
    requested: &mut Vec<String>,
    skip_optional: bool,
) -> Vec<&'a ServiceConfig> {
    for filter in FILTERS {
        if !(filter.applies)(op) {
            continue;
        }
        if !skip_optional {
            requested.push(filter.name.to_string());
        }
        if skip_optional && filter.optional {
            continue;
        }
        candidates.retain(|s| (filter.matches)(op, s));
    }
    candidates
}

fn validate_service(service: &ServiceConfig, max_granule_limit: i32) -> Result<(), RegistryError> {
    for step in &service.steps {
        if step.is_batched {
            match step.max_batch_inputs {
                Some(n) if n > 0 && n <= max_granule_limit => {}
                _ => {
                    return Err(RegistryError::InvalidBatchSize {
                        service: service.name.clone(),
                        cap: max_granule_limit,
                    })
                }
            }
            if matches!(step.max_batch_size_in_bytes, Some(n) if n <= 0) {
                return Err(RegistryError::InvalidBatchSize {
                    service: service.name.clone(),
                    cap: max_granule_limit,
                });
            }
        }
        if step.is_query_step() && !step.is_sequential {
            return Err(RegistryError::QueryStepNotSequential {
                service: service.name.clone(),
            });
        }
    }
    if !service.all_collections && service.collections.is_empty() {
        return Err(RegistryError::MissingCollections {
            service: service.name.clone(),
        });
    }
    if !service.all_collections && service.umm_s.is_none() {
        return Err(RegistryError::MissingUmmS {
            service: service.name.clone(),
        });
    }
    Ok(())
}

/// Replaces `${VAR}` references from the environment. A value that is
/// exactly one reference and resolves to an integer stays unquoted so that
/// numeric fields parse as numbers.
fn substitute_env(yaml: &str, env: &HashMap<String, String>) -> Result<String, RegistryError> {
    let mut result = String::with_capacity(yaml.len());
    let mut rest = yaml;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let var = &after[..end];
        match env.get(var) {
            Some(value) => result.push_str(value),
            None => {
                return Err(RegistryError::UnresolvedEnv {
                    var: var.to_string(),
                })
            }
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// `<SERVICE>_COLLECTIONS` appends manual allow-list entries (comma
/// separated collection concept ids) for the service whose name maps to the
/// variable prefix.
fn apply_collection_overrides(service: &mut ServiceConfig, env: &HashMap<String, String>) {
    let key = format!("{}_COLLECTIONS", service_name_to_env_prefix(&service.name));
    if let Some(value) = env.get(&key) {
        for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if !service.collections.iter().any(|c| c.id == id) {
                service.collections.push(CollectionCapability {
                    id: id.to_string(),
                    variables: None,
                    granule_limit: None,
                });
            }
        }
    }
}

fn service_name_to_env_prefix(name: &str) -> String {
    name.to_uppercase().replace(['-', '/'], "_")
}

/// `harmonyservices/query-cmr:latest` -> `query-cmr`.
pub fn image_basename(image: &str) -> String {
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    after_slash
        .split(':')
        .next()
        .unwrap_or(after_slash)
        .to_string()
}

fn env_suffix_to_service_name(prefix: &str) -> String {
    prefix.to_lowercase().replace('_', "-")
}

/// Builds the service-name -> image map from `<SERVICE>_IMAGE` variables.
fn image_map_from_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter_map(|(key, value)| {
            key.strip_suffix("_IMAGE")
                .map(|prefix| (env_suffix_to_service_name(prefix), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::let_assert;
    use harmony_common::model::RequestId;
    use harmony_common::operation::{DataSource, OperationDocument, Variable};

    const REGISTRY_YAML: &str = r#"
services:
  - name: subsetter
    data_operation_version: "0.22.0"
    umm_s: S1000-EXAMPLE
    concurrency: ${SUBSETTER_CONCURRENCY}
    collections:
      - id: C1233800302-EEDTEST
        variables: [alpha_var, blue_var]
    capabilities:
      subsetting:
        bbox: true
        temporal: true
        variable: true
        multiple_variable: true
      output_formats: [image/tiff, image/png]
      reprojection: true
    steps:
      - image: "harmonyservices/query-cmr:latest"
        is_sequential: true
      - image: "${SUBSETTER_IMAGE}"
        operations: [spatialSubset, variableSubset, reformat]
  - name: reformatter
    data_operation_version: "0.21.0"
    all_collections: true
    capabilities:
      output_formats: [image/tiff]
    steps:
      - image: "harmonyservices/query-cmr:latest"
        is_sequential: true
      - image: "example/reformatter:1"
        operations: [reformat]
"#;

    fn test_env() -> HashMap<String, String> {
        HashMap::from([
            ("SUBSETTER_IMAGE".to_string(), "example/subsetter:9".to_string()),
            ("SUBSETTER_CONCURRENCY".to_string(), "7".to_string()),
        ])
    }

    fn load_registry() -> ServiceRegistry {
        ServiceRegistry::load(REGISTRY_YAML, &test_env(), 10000).expect("registry loads")
    }

    fn operation_on_collection(collection: &str) -> OperationDocument {
        OperationDocument::builder(RequestId::new_v4(), "jdoe", "harmony-test")
            .source(DataSource {
                collection: CollectionId(collection.to_string()),
                short_name: "harmony_example".to_string(),
                version_id: "1".to_string(),
                variables: vec![],
                coordinate_variables: vec![],
                granules: None,
            })
            .staging_location("s3://staging/public/x/")
            .build()
    }

    #[test]
    fn environment_substitution_parses_integers_as_integers() {
        let registry = load_registry();
        let subsetter = registry.find_by_name("subsetter").unwrap();
        assert_eq!(subsetter.concurrency, Some(7));
        assert_eq!(subsetter.steps[1].image, "example/subsetter:9");
    }

    #[test]
    fn unresolved_variables_are_fatal() {
        let result = ServiceRegistry::load(REGISTRY_YAML, &HashMap::new(), 10000);
        let_assert!(Err(RegistryError::UnresolvedEnv { var }) = result);
        assert!(var == "SUBSETTER_IMAGE" || var == "SUBSETTER_CONCURRENCY");
    }

    #[test]
    fn query_step_must_be_sequential() {
        let yaml = r#"
services:
  - name: broken
    data_operation_version: "0.22.0"
    all_collections: true
    steps:
      - image: "harmonyservices/query-cmr:latest"
"#;
        let result = ServiceRegistry::load(yaml, &HashMap::new(), 10000);
        let_assert!(Err(RegistryError::QueryStepNotSequential { service }) = result);
        assert_eq!(service, "broken");
    }

    #[test]
    fn collection_list_or_all_collections_is_required() {
        let yaml = r#"
services:
  - name: no-collections
    data_operation_version: "0.22.0"
    umm_s: S1-EX
    steps:
      - image: "example/one:1"
"#;
        let result = ServiceRegistry::load(yaml, &HashMap::new(), 10000);
        let_assert!(Err(RegistryError::MissingCollections { .. }) = result);
    }

    #[test]
    fn batched_steps_need_positive_bounded_inputs() {
        let yaml = r#"
services:
  - name: bad-batch
    data_operation_version: "0.22.0"
    all_collections: true
    steps:
      - image: "example/concat:1"
        is_batched: true
        max_batch_inputs: 0
"#;
        let result = ServiceRegistry::load(yaml, &HashMap::new(), 10000);
        let_assert!(Err(RegistryError::InvalidBatchSize { .. }) = result);
    }

    #[test]
    fn collection_overrides_append_allow_list_entries() {
        let mut env = test_env();
        env.insert(
            "SUBSETTER_COLLECTIONS".to_string(),
            "C555-EXTRA, C556-EXTRA".to_string(),
        );
        let registry = ServiceRegistry::load(REGISTRY_YAML, &env, 10000).unwrap();
        let subsetter = registry.find_by_name("subsetter").unwrap();
        assert!(subsetter.collections.iter().any(|c| c.id == "C555-EXTRA"));
        assert!(subsetter.collections.iter().any(|c| c.id == "C556-EXTRA"));
    }

    #[test]
    fn strict_match_prefers_a_fully_capable_service() {
        let registry = load_registry();
        let mut op = operation_on_collection("C1233800302-EEDTEST");
        op.sources[0].variables.push(Variable {
            id: "V1-EEDTEST".to_string(),
            name: "alpha_var".to_string(),
            full_path: "/alpha_var".to_string(),
        });
        op.subset.bbox = Some([-130.0, -45.0, 130.0, 45.0]);
        op.format.mime = Some("image/tiff".to_string());

        let chosen = registry.choose(&op, &RequestContext::default()).unwrap();
        assert_eq!(chosen.config.name, "subsetter");
        assert!(chosen.warning.is_none());
    }

    #[test]
    fn best_effort_drops_the_single_optional_subset() {
        let registry = load_registry();
        // reformat on a collection only the all-collections reformatter
        // accepts, plus a spatial subset nobody supports for it
        let mut op = operation_on_collection("C9999-OTHER");
        op.subset.bbox = Some([-10.0, -10.0, 10.0, 10.0]);
        op.format.mime = Some("image/tiff".to_string());

        let chosen = registry.choose(&op, &RequestContext::default()).unwrap();
        assert_eq!(chosen.config.name, "reformatter");
        assert_eq!(chosen.warning.as_deref(), Some(BEST_EFFORT_WARNING));
    }

    #[test]
    fn no_match_lists_the_requested_operations() {
        let registry = load_registry();
        let mut op = operation_on_collection("C1233800302-EEDTEST");
        op.subset.bbox = Some([-10.0, -10.0, 10.0, 10.0]);
        op.extend_dimensions = Some(vec!["time".to_string()]);

        let_assert!(Err(error) = registry.choose(&op, &RequestContext::default()));
        assert!(error.requested_operations.contains(&"extend".to_string()));
        assert!(error
            .collections
            .contains(&"C1233800302-EEDTEST".to_string()));
    }

    #[test]
    fn variable_allow_lists_are_enforced_per_collection() {
        let registry = load_registry();
        let mut op = operation_on_collection("C1233800302-EEDTEST");
        op.sources[0].variables.push(Variable {
            id: "V2-EEDTEST".to_string(),
            name: "not_allowed_var".to_string(),
            full_path: "/not_allowed_var".to_string(),
        });

        // falls through to the all-collections reformatter
        let chosen = registry.choose(&op, &RequestContext::default()).unwrap();
        assert_eq!(chosen.config.name, "reformatter");
    }

    #[test]
    fn image_map_is_built_from_env_and_refreshable() {
        let mut env = test_env();
        env.insert(
            "QUERY_CMR_IMAGE".to_string(),
            "harmonyservices/query-cmr:deployed".to_string(),
        );
        let registry = ServiceRegistry::load(REGISTRY_YAML, &env, 10000).unwrap();
        let step = &registry.find_by_name("subsetter").unwrap().steps[0];
        assert_eq!(
            registry.image_for(step),
            "harmonyservices/query-cmr:deployed"
        );

        registry.update_image("query-cmr", "harmonyservices/query-cmr:canary");
        assert_eq!(registry.image_for(step), "harmonyservices/query-cmr:canary");
    }
}
