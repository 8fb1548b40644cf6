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

//! Failure policy: classifies work item errors and decides whether to
//! requeue the item, fail the item, or fail the whole job. Job-level
//! collapse (ignore-errors vs strict) is applied where the decisions are
//! made durable, inside the completion transaction.

use harmony_common::model::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeue with an incremented retry count.
    Retry,
    /// The item is failed; the job outcome depends on its ignore-errors
    /// flag.
    FailItem,
    /// Not worth continuing: the whole job fails regardless of
    /// ignore-errors.
    FailJob,
}

/// Workers usually report a kind; legacy services only send a message, so
/// fall back to sniffing it.
pub fn classify_error(kind: Option<ErrorKind>, message: Option<&str>) -> ErrorKind {
    if let Some(kind) = kind {
        return kind;
    }
    let Some(message) = message else {
        return ErrorKind::Unknown;
    };
    let lowered = message.to_lowercase();
    if lowered.contains("timed out") || lowered.contains("timeout") {
        ErrorKind::Timeout
    } else if lowered.contains("unauthorized") || lowered.contains("forbidden") {
        ErrorKind::Auth
    } else if lowered.contains("connection") || lowered.contains("unavailable") {
        ErrorKind::TransientInfrastructure
    } else {
        ErrorKind::ServiceReported
    }
}

pub fn disposition(kind: ErrorKind, retry_count: i32, retry_cap: i32) -> FailureDisposition {
    match kind {
        ErrorKind::TransientInfrastructure | ErrorKind::Timeout => {
            if retry_count < retry_cap {
                FailureDisposition::Retry
            } else {
                FailureDisposition::FailItem
            }
        }
        ErrorKind::ServiceReported | ErrorKind::Validation | ErrorKind::Unknown => {
            FailureDisposition::FailItem
        }
        ErrorKind::Auth | ErrorKind::Capacity => FailureDisposition::FailJob,
    }
}
