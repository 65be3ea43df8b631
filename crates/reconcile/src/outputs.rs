//! Named outputs exported after a run

use crate::error::Error;
use crate::state::StateSnapshot;
use crate::value::{Json, OutputRef};
use std::collections::BTreeMap;

/// A named expression evaluated against state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub value: OutputRef,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, value: OutputRef) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Resolve every output against a snapshot, ordered by name
pub fn export(specs: &[OutputSpec], snapshot: &StateSnapshot) -> Result<BTreeMap<String, Json>, Error> {
    let mut values = BTreeMap::new();
    for spec in specs {
        let reference = &spec.value;
        let state = snapshot
            .get(&reference.resource)
            .ok_or_else(|| Error::OutputResolution {
                output: spec.name.clone(),
                resource: reference.resource.clone(),
                reason: "resource has not been applied".to_string(),
            })?;
        let value = state
            .attribute(&reference.path)
            .ok_or_else(|| Error::OutputResolution {
                output: spec.name.clone(),
                resource: reference.resource.clone(),
                reason: format!("no attribute `{}`", reference.path),
            })?;
        values.insert(spec.name.clone(), value);
    }
    Ok(values)
}
