//! Matrix expansion

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// One matrix combination, in axis declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    values: Vec<(String, String)>,
}

impl Combination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a value, replacing an existing one with the same key
    pub fn set(&mut self, key: &str, value: &str) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.values.push((key.to_string(), value.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values joined for display: `3.12` or `3.12, ubuntu`
    pub fn label(&self) -> String {
        self.values
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// True when every key in `pattern` has the same value here
    fn matches_all(&self, pattern: &Combination) -> bool {
        pattern.iter().all(|(k, v)| self.get(k) == Some(v))
    }
}

/// A job's `strategy.matrix`
#[derive(Debug, Clone, Default)]
pub struct Matrix {
    axes: Vec<(String, Vec<String>)>,
    include: Vec<Combination>,
    exclude: Vec<Combination>,
}

impl Matrix {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_mapping().context("'matrix' must be a mapping")?;
        let mut matrix = Matrix::default();

        for (key, entry) in map {
            let key = key.as_str().context("Matrix keys must be strings")?;
            match key {
                "include" => matrix.include = combination_list(entry, "include")?,
                "exclude" => matrix.exclude = combination_list(entry, "exclude")?,
                axis => {
                    let values = entry
                        .as_sequence()
                        .with_context(|| format!("Matrix axis '{}' must be a list", axis))?
                        .iter()
                        .map(|v| {
                            scalar_to_string(v).with_context(|| {
                                format!("Matrix axis '{}' must contain scalar values", axis)
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    matrix.axes.push((axis.to_string(), values));
                }
            }
        }

        Ok(matrix)
    }

    /// Expand into concrete combinations: cartesian product of the axes,
    /// minus `exclude`, then `include` entries merged into matching
    /// combinations or appended when nothing matches.
    pub fn expand(&self) -> Vec<Combination> {
        let mut combinations = if self.axes.is_empty() {
            Vec::new()
        } else {
            let mut product = vec![Combination::new()];
            for (axis, values) in &self.axes {
                let mut next = Vec::with_capacity(product.len() * values.len());
                for combination in &product {
                    for value in values {
                        let mut extended = combination.clone();
                        extended.set(axis, value);
                        next.push(extended);
                    }
                }
                product = next;
            }
            product
        };

        combinations.retain(|c| !self.exclude.iter().any(|pattern| c.matches_all(pattern)));

        let axis_names: Vec<&str> = self.axes.iter().map(|(k, _)| k.as_str()).collect();
        let original_len = combinations.len();
        for entry in &self.include {
            // only the axis keys decide whether an include extends a combination
            let mut axis_part = Combination::new();
            for (k, v) in entry.iter() {
                if axis_names.contains(&k) {
                    axis_part.set(k, v);
                }
            }

            let mut merged = false;
            for combination in combinations.iter_mut().take(original_len) {
                if combination.matches_all(&axis_part) {
                    for (k, v) in entry.iter() {
                        if !axis_names.contains(&k) {
                            combination.set(k, v);
                        }
                    }
                    merged = true;
                }
            }
            if !merged {
                combinations.push(entry.clone());
            }
        }

        combinations
    }
}

fn combination_list(value: &Value, what: &str) -> Result<Vec<Combination>> {
    let items = value
        .as_sequence()
        .with_context(|| format!("Matrix '{}' must be a list of mappings", what))?;
    items
        .iter()
        .map(|item| {
            let map = item
                .as_mapping()
                .with_context(|| format!("Matrix '{}' entries must be mappings", what))?;
            let mut combination = Combination::new();
            for (k, v) in map {
                let key = k.as_str().context("Matrix keys must be strings")?;
                let Some(value) = scalar_to_string(v) else {
                    bail!("Matrix '{}' value for '{}' must be a scalar", what, key);
                };
                combination.set(key, &value);
            }
            Ok(combination)
        })
        .collect()
}

/// Render a YAML scalar as a string; `None` for mappings, lists and null
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
