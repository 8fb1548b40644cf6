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

use poem_openapi::{Enum, Object};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Object)]
pub struct Empty {}

macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> $name {
                $name(uuid::Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid =
                    uuid::Uuid::parse_str(s).map_err(|err| format!("Invalid {}: {err}", stringify!($name)))?;
                Ok($name(uuid))
            }
        }
    };
}

newtype_uuid!(JobId);
newtype_uuid!(RequestId);

/// Work item ids are allocated by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub i64);

impl Display for WorkItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The docker image tag a service runs as, e.g.
/// `harmonyservices/query-cmr:latest`. Doubles as the scheduling key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CMR collection concept id, e.g. `C1233800302-EEDTEST`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub String);

impl CollectionId {
    /// The provider token embedded after the dash of a concept id
    /// (`C1233800302-EEDTEST` -> `EEDTEST`).
    pub fn provider_id(&self) -> Option<ProviderId> {
        self.0
            .split_once('-')
            .map(|(_, provider)| ProviderId(provider.to_string()))
    }
}

impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Previewing,
    Running,
    Paused,
    Canceled,
    Successful,
    CompleteWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Canceled
                | JobStatus::Successful
                | JobStatus::CompleteWithErrors
                | JobStatus::Failed
        )
    }

    /// The allowed transition table. Transitions are monotonic except for
    /// running<->paused and the initial accepted|previewing->running moves;
    /// a terminal status is absorbing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Accepted => matches!(next, Previewing | Running | Canceled | Failed),
            Previewing => matches!(next, Running | Canceled | Failed),
            Running => matches!(
                next,
                Paused | Canceled | Successful | CompleteWithErrors | Failed
            ),
            Paused => matches!(next, Running | Canceled | Failed),
            Canceled | Successful | CompleteWithErrors | Failed => false,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "The job has been submitted and is being processed",
            JobStatus::Previewing => "The job is generating a preview of the output",
            JobStatus::Running => "The job is being processed",
            JobStatus::Paused => "The job is paused and may be resumed using the provided link",
            JobStatus::Canceled => "The job was canceled",
            JobStatus::Successful => "The job has completed with success",
            JobStatus::CompleteWithErrors => {
                "The job has completed with errors. See the errors field for more details"
            }
            JobStatus::Failed => "The job failed with an internal error",
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkItemStatus {
    Ready,
    Queued,
    Running,
    Successful,
    Failed,
    Canceled,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Successful | WorkItemStatus::Failed | WorkItemStatus::Canceled
        )
    }
}

/// Failure taxonomy used to decide retries and job outcomes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    TransientInfrastructure,
    ServiceReported,
    Validation,
    Timeout,
    Auth,
    Capacity,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

/// Response of `GET /service/work`, consumed by the worker loop.
#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkForService {
    pub work_item: WorkItemWire,
    /// Page size bound for the CMR query step; absent for other services.
    pub max_cmr_granules: Option<i64>,
}

/// The slice of a work item a worker needs in order to invoke its service.
#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkItemWire {
    pub id: i64,
    pub job_id: Uuid,
    pub service_id: String,
    pub workflow_step_index: i32,
    /// CMR session cursor; mutually exclusive with `stac_catalog_locations`.
    pub scroll_id: Option<String>,
    /// STAC catalog URLs holding the inputs produced by the previous step.
    /// More than one entry only for batched steps.
    #[serde(default)]
    #[oai(default)]
    pub stac_catalog_locations: Vec<String>,
    /// The operation document projected for this step, in wire form.
    pub operation: serde_json::Value,
    pub retry_count: i32,
}

/// Body of `PUT /service/work/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkItemCompletion {
    pub status: WorkItemStatus,
    #[serde(default)]
    #[oai(default)]
    pub results: Vec<String>,
    #[serde(default)]
    #[oai(default)]
    pub total_granules_size: i64,
    #[serde(default)]
    #[oai(default)]
    pub output_item_sizes: Vec<i64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub scroll_id: Option<String>,
    /// Total granule hits reported by the CMR query service on its first page.
    pub hits: Option<i64>,
}
