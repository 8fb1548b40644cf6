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

//! Versioned wire format of the operation document.
//!
//! Documents are held at the current schema version; consumers that speak an
//! older version get a downgraded rendition. Each downgrade step is a pure
//! function that removes exactly the fields its version introduced, so the
//! pipeline from version N to any older version is deterministic and total.

use super::OperationDocument;
use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const CURRENT_SCHEMA_VERSION: &str = "0.22.0";
pub const EARLIEST_SCHEMA_VERSION: &str = "0.18.0";

struct SchemaVersion {
    version: &'static str,
    schema: &'static str,
    /// Removes the fields this version introduced, turning a document of
    /// this version into one of the previous version. `None` marks the
    /// earliest registered schema.
    strip: Option<fn(&mut Value)>,
}

fn strip_0_22_0(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.remove("average");
    }
}

fn strip_0_21_0(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.remove("extendDimensions");
    }
}

fn strip_0_20_0(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.remove("extraArgs");
        if let Some(format) = object.get_mut("format").and_then(Value::as_object_mut) {
            format.remove("srs");
        }
    }
}

fn strip_0_19_0(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.remove("destinationUrl");
    }
}

/// Newest first. The downgrade pipeline applies the `strip` functions of all
/// versions above the target, in order.
static SUPPORTED_VERSIONS: &[SchemaVersion] = &[
    SchemaVersion {
        version: "0.22.0",
        schema: include_str!("schemas/data-operation-v0.22.0.json"),
        strip: Some(strip_0_22_0),
    },
    SchemaVersion {
        version: "0.21.0",
        schema: include_str!("schemas/data-operation-v0.21.0.json"),
        strip: Some(strip_0_21_0),
    },
    SchemaVersion {
        version: "0.20.0",
        schema: include_str!("schemas/data-operation-v0.20.0.json"),
        strip: Some(strip_0_20_0),
    },
    SchemaVersion {
        version: "0.19.0",
        schema: include_str!("schemas/data-operation-v0.19.0.json"),
        strip: Some(strip_0_19_0),
    },
    SchemaVersion {
        version: "0.18.0",
        schema: include_str!("schemas/data-operation-v0.18.0.json"),
        strip: None,
    },
];

#[derive(Debug, thiserror::Error)]
pub enum OperationSchemaError {
    #[error(
        "Schema version {requested} is not supported; the earliest registered version is {earliest}"
    )]
    SchemaRange {
        requested: String,
        earliest: &'static str,
    },
    #[error("Operation document is not valid against schema version {version}: {}", errors.join("; "))]
    SchemaValidation {
        version: String,
        errors: Vec<String>,
    },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub fn supported_versions() -> Vec<&'static str> {
    SUPPORTED_VERSIONS.iter().map(|s| s.version).collect()
}

fn validators() -> &'static HashMap<&'static str, Validator> {
    static VALIDATORS: OnceLock<HashMap<&'static str, Validator>> = OnceLock::new();
    VALIDATORS.get_or_init(|| {
        SUPPORTED_VERSIONS
            .iter()
            .map(|s| {
                let schema: Value =
                    serde_json::from_str(s.schema).expect("embedded schema is valid JSON");
                let validator = jsonschema::validator_for(&schema)
                    .expect("embedded schema compiles");
                (s.version, validator)
            })
            .collect()
    })
}

fn validate(value: &Value, version: &str) -> Result<(), OperationSchemaError> {
    let validator = validators()
        .get(version)
        .expect("validator exists for every supported version");
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|error| format!("{} at {}", error, error.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OperationSchemaError::SchemaValidation {
            version: version.to_string(),
            errors,
        })
    }
}

impl OperationDocument {
    /// Renders the document as JSON at the requested schema version by
    /// applying the downgrade pipeline, then validates the projection.
    pub fn to_versioned_value(&self, version: &str) -> Result<Value, OperationSchemaError> {
        let target_index = SUPPORTED_VERSIONS
            .iter()
            .position(|s| s.version == version)
            .ok_or_else(|| OperationSchemaError::SchemaRange {
                requested: version.to_string(),
                earliest: EARLIEST_SCHEMA_VERSION,
            })?;

        let mut value = serde_json::to_value(self)?;
        for newer in &SUPPORTED_VERSIONS[..target_index] {
            let strip = newer
                .strip
                .expect("only the earliest version has no strip function");
            strip(&mut value);
        }
        value["version"] = Value::String(version.to_string());

        validate(&value, version)?;
        Ok(value)
    }

    pub fn serialize(&self, version: &str) -> Result<Vec<u8>, OperationSchemaError> {
        Ok(serde_json::to_vec(&self.to_versioned_value(version)?)?)
    }

    /// Parses a document of the given version. Fields introduced by newer
    /// versions come back at their defaults.
    pub fn deserialize(bytes: &[u8], version: &str) -> Result<OperationDocument, OperationSchemaError> {
        if !SUPPORTED_VERSIONS.iter().any(|s| s.version == version) {
            return Err(OperationSchemaError::SchemaRange {
                requested: version.to_string(),
                earliest: EARLIEST_SCHEMA_VERSION,
            });
        }
        let value: Value = serde_json::from_slice(bytes)?;
        validate(&value, version)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::super::tests::example_operation;
    use super::*;
    use assert2::let_assert;

    #[test]
    fn current_version_serializes_and_validates() {
        let op = example_operation();
        let value = op.to_versioned_value(CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(value["version"], "0.22.0");
        assert_eq!(value["average"], "time");
        assert_eq!(value["extendDimensions"][0], "time");
    }

    #[test]
    fn downgrades_remove_exactly_the_fields_each_version_introduced() {
        let op = example_operation();

        let v21 = op.to_versioned_value("0.21.0").unwrap();
        assert!(v21.get("average").is_none());
        assert!(v21.get("extendDimensions").is_some());

        let v20 = op.to_versioned_value("0.20.0").unwrap();
        assert!(v20.get("extendDimensions").is_none());
        assert!(v20["format"].get("srs").is_some());

        let v19 = op.to_versioned_value("0.19.0").unwrap();
        assert!(v19["format"].get("srs").is_none());
        assert!(v19.get("extraArgs").is_none());
        assert!(v19.get("destinationUrl").is_some());

        let v18 = op.to_versioned_value("0.18.0").unwrap();
        assert!(v18.get("destinationUrl").is_none());
        assert_eq!(v18["version"], "0.18.0");
        // sources survive every downgrade
        assert_eq!(v18["sources"][0]["collection"], "C1233800302-EEDTEST");
    }

    #[test]
    fn round_trip_equals_the_downgraded_document() {
        let op = example_operation();
        let bytes = op.serialize("0.19.0").unwrap();
        let parsed = OperationDocument::deserialize(&bytes, "0.19.0").unwrap();

        let mut expected = op.clone();
        expected.version = "0.19.0".to_string();
        expected.average = None;
        expected.extend_dimensions = None;
        expected.extra_args = None;
        expected.format.srs = None;
        assert_eq!(parsed, expected);
    }

    #[test]
    fn unknown_versions_are_a_range_error() {
        let op = example_operation();
        let_assert!(
            Err(OperationSchemaError::SchemaRange { requested, earliest }) =
                op.serialize("0.4.0")
        );
        assert_eq!(requested, "0.4.0");
        assert_eq!(earliest, "0.18.0");
    }

    #[test]
    fn invalid_documents_fail_validation_on_deserialize() {
        let bytes = br#"{"version": "0.18.0", "user": 42}"#;
        let_assert!(
            Err(OperationSchemaError::SchemaValidation { version, errors }) =
                OperationDocument::deserialize(bytes, "0.18.0")
        );
        assert_eq!(version, "0.18.0");
        assert!(!errors.is_empty());
    }
}
