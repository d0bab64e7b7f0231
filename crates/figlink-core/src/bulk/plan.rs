//! Bulk detection and fan-out planning.

use crate::{BridgeError, Result};
use serde_json::{Map, Value};

/// Parameters of one command.
pub type Params = Map<String, Value>;

/// Whether the command should fan out.
///
/// True when any declared bulk parameter holds an array whose length is not
/// one. A one-element array behaves like a scalar.
pub fn is_bulk<S: AsRef<str>>(params: &Params, bulk_params: &[S]) -> bool {
    bulk_params
        .iter()
        .filter_map(|name| params.get(name.as_ref()))
        .any(|value| matches!(value, Value::Array(items) if items.len() != 1))
}

/// Unwrap one-element arrays of bulk parameters into scalars.
///
/// Lets a non-bulk handler validate `{"nodeId": ["1:2"]}` as `{"nodeId": "1:2"}`.
pub fn extract_single_values<S: AsRef<str>>(params: &Params, bulk_params: &[S]) -> Params {
    let mut single = params.clone();
    for name in bulk_params {
        if let Some(value) = single.get_mut(name.as_ref()) {
            if let Value::Array(items) = value {
                if items.len() == 1 {
                    let only = items.remove(0);
                    *value = only;
                }
            }
        }
    }
    single
}

/// Longest array among the declared bulk parameters; 1 if none is an array.
pub fn fanout_length<S: AsRef<str>>(params: &Params, bulk_params: &[S]) -> usize {
    bulk_params
        .iter()
        .filter_map(|name| match params.get(name.as_ref()) {
            Some(Value::Array(items)) => Some(items.len()),
            _ => None,
        })
        .max()
        .unwrap_or(1)
}

/// Per-item commands derived from one bulk command.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkPlan {
    fanout_length: usize,
    items: Vec<Params>,
}

impl BulkPlan {
    /// Expand `params` into per-item parameter sets.
    ///
    /// Item `i` takes `array[i % array.len()]` from every array-valued bulk
    /// parameter and the scalar itself from scalar ones; everything else is
    /// copied verbatim. An empty bulk array next to a non-empty one leaves
    /// nothing to cycle and is rejected.
    pub fn build<S: AsRef<str>>(params: &Params, bulk_params: &[S]) -> Result<Self> {
        let fanout_length = fanout_length(params, bulk_params);
        if fanout_length == 0 {
            return Ok(Self {
                fanout_length,
                items: Vec::new(),
            });
        }

        let present: Vec<(&str, &Value)> = bulk_params
            .iter()
            .filter_map(|name| {
                params
                    .get_key_value(name.as_ref())
                    .map(|(key, value)| (key.as_str(), value))
            })
            .collect();

        for (name, value) in &present {
            if matches!(value, Value::Array(items) if items.is_empty()) {
                return Err(BridgeError::Validation {
                    field: name.to_string(),
                    message: format!(
                        "bulk parameter is empty but {} other items were requested",
                        fanout_length
                    ),
                });
            }
        }

        let items = (0..fanout_length)
            .map(|index| {
                let mut item = params.clone();
                for (name, value) in &present {
                    let selected = match value {
                        Value::Array(values) => values[index % values.len()].clone(),
                        scalar => (*scalar).clone(),
                    };
                    item.insert(name.to_string(), selected);
                }
                item
            })
            .collect();

        Ok(Self {
            fanout_length,
            items,
        })
    }

    pub fn fanout_length(&self) -> usize {
        self.fanout_length
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Params] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Params> {
        self.items
    }
}
