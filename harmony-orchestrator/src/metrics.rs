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

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};

lazy_static! {
    pub static ref WORK_ITEMS_CLAIMED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "harmony_work_items_claimed_total",
            "Work items handed out to pods",
        ),
        &["service"],
    )
    .unwrap();
    pub static ref WORK_ITEMS_COMPLETED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "harmony_work_items_completed_total",
            "Work item completions by final status",
        ),
        &["status"],
    )
    .unwrap();
    pub static ref JOB_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "harmony_jobs_finalized_total",
            "Jobs reaching a terminal status",
        ),
        &["status"],
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    let registry = Registry::new();

    registry
        .register(Box::new(WORK_ITEMS_CLAIMED.clone()))
        .unwrap();
    registry
        .register(Box::new(WORK_ITEMS_COMPLETED.clone()))
        .unwrap();
    registry
        .register(Box::new(JOB_TRANSITIONS.clone()))
        .unwrap();

    registry
}
