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

//! The operation document: the single source of truth for one transformation
//! request. It is assembled once from the resolved request, stored at the
//! current schema version, and downgraded per consumer. Each workflow step
//! receives a projection that retains only the capabilities that step
//! implements.

pub mod versions;

use crate::crypto::{CryptoError, TokenCipher};
use crate::model::{CollectionId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use versions::{OperationSchemaError, CURRENT_SCHEMA_VERSION, EARLIEST_SCHEMA_VERSION};

/// Side length in degrees of the synthetic bounding box built around a point
/// subset when a service only supports bounding rectangles.
pub const DEFAULT_POINT_BBOX_SIDE_DEGREES: f64 = 0.0001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDocument {
    pub version: String,
    pub request_id: RequestId,
    pub user: String,
    /// Encrypted at rest; see [`crate::crypto::TokenCipher`].
    pub access_token: String,
    pub client_id: String,
    pub sources: Vec<DataSource>,
    pub format: OutputFormat,
    pub subset: Subset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalRange>,
    pub concatenate: bool,
    /// `None`: not mentioned in the request. `Some([])`: the user explicitly
    /// disabled extension. `Some(dims)`: extend along these dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend_dimensions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<AveragingKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<serde_json::Map<String, serde_json::Value>>,
    pub staging_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub collection: CollectionId,
    pub short_name: String,
    pub version_id: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub coordinate_variables: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granules: Option<Vec<Granule>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub name: String,
    pub full_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Granule {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// `[West, South, East, North]` in degrees.
pub type BoundingBox = [f64; 4];

/// `[longitude, latitude]` in degrees.
pub type Point = [f64; 2];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<ShapeSubset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<DimensionRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeSubset {
    /// Staged GeoJSON FeatureCollection referenced by URL.
    Reference(ShapeReference),
    /// Inline GeoJSON FeatureCollection wrapping a Polygon or MultiPolygon.
    Inline(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeReference {
    pub href: String,
    #[serde(rename = "type")]
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionRange {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<Srs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_extent: Option<ScaleExtent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_size: Option<ScaleSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Srs {
    pub proj4: String,
    pub wkt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleExtent {
    pub x: AxisRange,
    pub y: AxisRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSize {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AveragingKind {
    Time,
    Area,
}

/// The capability groups a workflow step's operation projection can retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Reproject,
    Reformat,
    VariableSubset,
    SpatialSubset,
    ShapeSubset,
    DimensionSubset,
    TemporalSubset,
}

/// One operation a service chain step declares it performs. The string forms
/// are the ones used in service descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepOperation {
    VariableSubset,
    SpatialSubset,
    ShapefileSubset,
    DimensionSubset,
    TemporalSubset,
    Reproject,
    Reformat,
    Concatenate,
    Extend,
    TimeAveraging,
    AreaAveraging,
}

impl StepOperation {
    /// Operations whose output is a set of catalogs spanning *all* inputs of
    /// the previous step, forcing the step to be aggregated.
    pub fn is_multi_catalog(&self) -> bool {
        matches!(self, StepOperation::Concatenate)
    }

    pub fn capability(&self) -> Option<Capability> {
        match self {
            StepOperation::VariableSubset => Some(Capability::VariableSubset),
            StepOperation::SpatialSubset => Some(Capability::SpatialSubset),
            StepOperation::ShapefileSubset => Some(Capability::ShapeSubset),
            StepOperation::DimensionSubset => Some(Capability::DimensionSubset),
            StepOperation::TemporalSubset => Some(Capability::TemporalSubset),
            StepOperation::Reproject => Some(Capability::Reproject),
            StepOperation::Reformat => Some(Capability::Reformat),
            StepOperation::Concatenate
            | StepOperation::Extend
            | StepOperation::TimeAveraging
            | StepOperation::AreaAveraging => None,
        }
    }
}

impl std::fmt::Display for StepOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).expect("StepOperation serialization");
        write!(f, "{}", s.as_str().expect("StepOperation is a string"))
    }
}

impl FromStr for StepOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Unknown operation: {s}"))
    }
}

impl OperationDocument {
    pub fn builder(request_id: RequestId, user: &str, client_id: &str) -> OperationBuilder {
        OperationBuilder::new(request_id, user, client_id)
    }

    /// Specialized copy for a single workflow step: only the named capability
    /// field groups are retained. Sources and collections are never dropped.
    pub fn project(&self, capabilities: &[Capability]) -> OperationDocument {
        let keep = |c: Capability| capabilities.contains(&c);
        let mut doc = self.clone();

        if !keep(Capability::Reproject) {
            doc.format.crs = None;
            doc.format.srs = None;
        }
        if !keep(Capability::Reformat) {
            doc.format.mime = None;
            doc.format.width = None;
            doc.format.height = None;
            doc.format.dpi = None;
            doc.format.scale_extent = None;
            doc.format.scale_size = None;
            doc.format.interpolation = None;
        }
        if !keep(Capability::VariableSubset) {
            for source in &mut doc.sources {
                source.variables.clear();
                source.coordinate_variables.clear();
            }
        }
        if !keep(Capability::SpatialSubset) {
            doc.subset.bbox = None;
            doc.subset.point = None;
        }
        if !keep(Capability::ShapeSubset) {
            doc.subset.shape = None;
        }
        if !keep(Capability::DimensionSubset) {
            doc.subset.dimensions.clear();
        }
        if !keep(Capability::TemporalSubset) {
            doc.temporal = None;
        }
        doc
    }

    pub fn decrypt_access_token(&self, cipher: &dyn TokenCipher) -> Result<String, CryptoError> {
        cipher.decrypt(&self.access_token)
    }

    pub fn collections(&self) -> Vec<&CollectionId> {
        self.sources.iter().map(|s| &s.collection).collect()
    }

    pub fn granule_count(&self) -> usize {
        self.sources
            .iter()
            .map(|s| s.granules.as_ref().map(|g| g.len()).unwrap_or(0))
            .sum()
    }

    // Request predicates driving service chain selection.

    pub fn requires_variable_subset(&self) -> bool {
        self.sources.iter().any(|s| !s.variables.is_empty())
    }

    pub fn requires_spatial_subset(&self) -> bool {
        self.subset.bbox.is_some() || self.subset.point.is_some()
    }

    pub fn requires_shape_subset(&self) -> bool {
        self.subset.shape.is_some()
    }

    pub fn requires_temporal_subset(&self) -> bool {
        self.temporal
            .as_ref()
            .map(|t| t.start.is_some() || t.end.is_some())
            .unwrap_or(false)
    }

    pub fn requires_dimension_subset(&self) -> bool {
        !self.subset.dimensions.is_empty()
    }

    pub fn requires_reprojection(&self) -> bool {
        self.format.crs.is_some() || self.format.srs.is_some()
    }

    pub fn requires_extend(&self) -> bool {
        self.extend_dimensions
            .as_ref()
            .map(|dims| !dims.is_empty())
            .unwrap_or(false)
    }

    pub fn extend_explicitly_disabled(&self) -> bool {
        self.extend_dimensions
            .as_ref()
            .map(|dims| dims.is_empty())
            .unwrap_or(false)
    }

    pub fn requires_reformat(&self, default_mime: Option<&str>) -> bool {
        match (&self.format.mime, default_mime) {
            (Some(requested), Some(native)) => requested != native,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Expands a point subset into a small square bounding box.
pub fn point_to_bbox(point: Point, side_degrees: f64) -> BoundingBox {
    let half = side_degrees / 2.0;
    [
        point[0] - half,
        point[1] - half,
        point[0] + half,
        point[1] + half,
    ]
}

pub struct OperationBuilder {
    doc: OperationDocument,
}

impl OperationBuilder {
    pub fn new(request_id: RequestId, user: &str, client_id: &str) -> Self {
        Self {
            doc: OperationDocument {
                version: CURRENT_SCHEMA_VERSION.to_string(),
                request_id,
                user: user.to_string(),
                access_token: String::new(),
                client_id: client_id.to_string(),
                sources: Vec::new(),
                format: OutputFormat::default(),
                subset: Subset::default(),
                temporal: None,
                concatenate: false,
                extend_dimensions: None,
                average: None,
                extra_args: None,
                staging_location: String::new(),
                destination_url: None,
            },
        }
    }

    /// The token must already be encrypted with the deployment's
    /// [`TokenCipher`].
    pub fn access_token(mut self, encrypted: &str) -> Self {
        self.doc.access_token = encrypted.to_string();
        self
    }

    pub fn source(mut self, source: DataSource) -> Self {
        self.doc.sources.push(source);
        self
    }

    pub fn bbox(mut self, bbox: BoundingBox) -> Self {
        self.doc.subset.bbox = Some(bbox);
        self
    }

    pub fn point(mut self, point: Point) -> Self {
        self.doc.subset.point = Some(point);
        self
    }

    pub fn shape(mut self, shape: ShapeSubset) -> Self {
        self.doc.subset.shape = Some(shape);
        self
    }

    pub fn dimension(mut self, range: DimensionRange) -> Self {
        self.doc.subset.dimensions.push(range);
        self
    }

    pub fn temporal(mut self, range: TemporalRange) -> Self {
        self.doc.temporal = Some(range);
        self
    }

    pub fn output_mime(mut self, mime: &str) -> Self {
        self.doc.format.mime = Some(mime.to_string());
        self
    }

    pub fn crs(mut self, crs: &str) -> Self {
        self.doc.format.crs = Some(crs.to_string());
        self
    }

    pub fn srs(mut self, srs: Srs) -> Self {
        self.doc.format.srs = Some(srs);
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.doc.format = format;
        self
    }

    pub fn concatenate(mut self, concatenate: bool) -> Self {
        self.doc.concatenate = concatenate;
        self
    }

    pub fn extend_dimensions(mut self, dimensions: Vec<String>) -> Self {
        self.doc.extend_dimensions = Some(dimensions);
        self
    }

    pub fn average(mut self, kind: AveragingKind) -> Self {
        self.doc.average = Some(kind);
        self
    }

    pub fn extra_args(mut self, args: serde_json::Map<String, serde_json::Value>) -> Self {
        self.doc.extra_args = Some(args);
        self
    }

    pub fn staging_location(mut self, url: &str) -> Self {
        self.doc.staging_location = url.to_string();
        self
    }

    pub fn destination_url(mut self, url: &str) -> Self {
        self.doc.destination_url = Some(url.to_string());
        self
    }

    pub fn build(self) -> OperationDocument {
        self.doc
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::RequestId;

    pub(crate) fn example_operation() -> OperationDocument {
        OperationDocument::builder(RequestId::new_v4(), "jdoe", "harmony-test")
            .access_token("encrypted-token")
            .source(DataSource {
                collection: CollectionId("C1233800302-EEDTEST".to_string()),
                short_name: "harmony_example".to_string(),
                version_id: "1".to_string(),
                variables: vec![Variable {
                    id: "V1233801695-EEDTEST".to_string(),
                    name: "alpha_var".to_string(),
                    full_path: "/alpha_var".to_string(),
                }],
                coordinate_variables: vec![],
                granules: None,
            })
            .bbox([-130.0, -45.0, 130.0, 45.0])
            .output_mime("image/tiff")
            .crs("EPSG:4326")
            .srs(Srs {
                proj4: "+proj=longlat +datum=WGS84 +no_defs".to_string(),
                wkt: "GEOGCS[\"WGS 84\"]".to_string(),
                epsg: Some("EPSG:4326".to_string()),
            })
            .extend_dimensions(vec!["time".to_string()])
            .average(AveragingKind::Time)
            .destination_url("s3://example-bucket/output")
            .staging_location("s3://staging/public/abc/")
            .build()
    }

    #[test]
    fn projection_drops_only_unnamed_capabilities() {
        let op = example_operation();
        let projected = op.project(&[Capability::VariableSubset, Capability::Reformat]);

        assert_eq!(projected.sources[0].variables.len(), 1);
        assert_eq!(projected.format.mime.as_deref(), Some("image/tiff"));
        assert_eq!(projected.format.crs, None);
        assert_eq!(projected.format.srs, None);
        assert_eq!(projected.subset.bbox, None);
        // sources are never dropped
        assert_eq!(projected.sources.len(), op.sources.len());
        assert_eq!(projected.sources[0].collection, op.sources[0].collection);
    }

    #[test]
    fn point_bbox_is_centered_on_the_point() {
        let bbox = point_to_bbox([10.0, 20.0], DEFAULT_POINT_BBOX_SIDE_DEGREES);
        assert!(bbox[0] < 10.0 && bbox[2] > 10.0);
        assert!(bbox[1] < 20.0 && bbox[3] > 20.0);
        assert!((bbox[2] - bbox[0] - DEFAULT_POINT_BBOX_SIDE_DEGREES).abs() < 1e-12);
    }

    #[test]
    fn step_operations_parse_from_descriptor_strings() {
        assert_eq!(
            StepOperation::from_str("shapefileSubset").unwrap(),
            StepOperation::ShapefileSubset
        );
        assert_eq!(
            StepOperation::Concatenate.to_string(),
            "concatenate".to_string()
        );
        assert!(StepOperation::from_str("makeCoffee").is_err());
    }

    #[test]
    fn extend_tristate() {
        let mut op = example_operation();
        assert!(op.requires_extend());
        op.extend_dimensions = Some(vec![]);
        assert!(!op.requires_extend());
        assert!(op.extend_explicitly_disabled());
        op.extend_dimensions = None;
        assert!(!op.extend_explicitly_disabled());
    }
}
