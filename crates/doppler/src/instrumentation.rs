// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named counter snapshots consumed by an external status endpoint.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Context {
    pub name: String,
    pub metrics: Vec<Metric>,
}

impl Context {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.metrics
            .iter()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }
}

/// Components that expose counters implement this; snapshots must never block the hot path.
pub trait Instrumentable {
    fn emit(&self) -> Context;
}
