// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching of process requirements against worker capabilities.
//!
//! Uses JSON containment, the same rule as PostgreSQL's `jsonb @>`:
//! objects match when every required key is present and its value is
//! contained, arrays match when every required element is contained in some
//! element of the offered array, and scalars match on equality. At the top
//! level only, an array also contains a bare scalar it has as an element.

use serde_json::Value;

use crate::model::Capabilities;

/// Whether a worker offering `capabilities` may claim a process with `requirements`.
///
/// Processes without requirements match every worker.
pub fn satisfies(requirements: Option<&Value>, capabilities: &Capabilities) -> bool {
    match requirements {
        None | Some(Value::Null) => true,
        Some(Value::Object(required)) => required.iter().all(|(key, value)| {
            capabilities
                .get(key)
                .is_some_and(|offered| contains_nested(offered, value))
        }),
        Some(_) => false,
    }
}

/// JSON containment: does `offered` contain `required`?
pub fn contains(offered: &Value, required: &Value) -> bool {
    match (offered, required) {
        (Value::Array(offered), scalar) if !scalar.is_array() && !scalar.is_object() => {
            offered.iter().any(|candidate| candidate == scalar)
        }
        _ => contains_nested(offered, required),
    }
}

/// Containment below the top level, where a scalar only matches a scalar.
fn contains_nested(offered: &Value, required: &Value) -> bool {
    match (offered, required) {
        (Value::Object(offered), Value::Object(required)) => required.iter().all(|(key, value)| {
            offered
                .get(key)
                .is_some_and(|candidate| contains_nested(candidate, value))
        }),
        (Value::Array(offered), Value::Array(required)) => required
            .iter()
            .all(|value| offered.iter().any(|candidate| contains_nested(candidate, value))),
        (offered, required) => offered == required,
    }
}
