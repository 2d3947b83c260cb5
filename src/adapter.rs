//! Adapters expand raw pipeline inputs into per-task job specifications and
//! consume the delocalized outputs after a run.

use indexmap::IndexMap;

use crate::config::AdapterOptions;
use crate::config::JobSpec;
use crate::config::RawInputs;
use crate::config::RawValue;
use crate::error::Error;
use crate::error::Result;
use crate::localization::OutputMap;

/// The input and output sides of a pipeline's data flow.
pub trait Adapter {
    /// Expands raw inputs into a mapping from task id to input name/value
    /// pairs.
    fn parse_inputs(&self, inputs: &RawInputs) -> Result<JobSpec>;

    /// Consumes the delocalized output mapping after the run completes.
    fn parse_outputs(&self, outputs: &OutputMap);
}

/// Instantiates the adapter selected by the configuration.
pub fn create(options: &AdapterOptions) -> Box<dyn Adapter> {
    match options {
        AdapterOptions::Manual { product } => Box::new(ManualAdapter { product: *product }),
    }
}

/// The manual adapter: inputs fan out into tasks with no external lookups.
struct ManualAdapter {
    /// When set, list-valued inputs combine as a cross product.
    product: bool,
}

impl ManualAdapter {
    /// Expands name/value inputs where list values fan out into tasks.
    fn expand(&self, inputs: &RawInputs) -> Result<JobSpec> {
        let mut lists: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for (name, value) in inputs {
            match value {
                RawValue::One(_) => {}
                RawValue::Many(items) => {
                    let values = items
                        .iter()
                        .map(|item| match item {
                            RawValue::One(s) => Ok(s.as_str()),
                            _ => Err(Error::config(format!(
                                "input `{name}` contains a nested list or mapping"
                            ))),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    if values.is_empty() {
                        return Err(Error::config(format!("input list for `{name}` is empty")));
                    }
                    lists.insert(name, values);
                }
                RawValue::Map(_) => {
                    return Err(Error::config(
                        "inputs must be either all per-task mappings or name/value pairs",
                    ));
                }
            }
        }

        let count = if self.product {
            lists.values().map(Vec::len).product()
        } else {
            let mut lens = lists.values().map(Vec::len);
            let first = lens.next().unwrap_or(1);
            if lens.any(|len| len != first) {
                return Err(Error::config(
                    "input lists must have equal lengths unless `product` is enabled",
                ));
            }
            first
        };

        let mut spec = JobSpec::new();
        for task in 0..count {
            // Mixed-radix decomposition of the task index over the list
            // lengths; the last declared list varies fastest.
            let mut chosen: IndexMap<&str, &str> = IndexMap::new();
            let mut rem = task;
            for (name, values) in lists.iter().rev() {
                let idx = if self.product {
                    let idx = rem % values.len();
                    rem /= values.len();
                    idx
                } else {
                    task
                };
                chosen.insert(name, values[idx]);
            }

            let mut task_inputs = IndexMap::new();
            for (name, value) in inputs {
                match value {
                    RawValue::One(s) => {
                        task_inputs.insert(name.clone(), s.clone());
                    }
                    RawValue::Many(_) => {
                        task_inputs.insert(name.clone(), chosen[name.as_str()].to_string());
                    }
                    RawValue::Map(_) => unreachable!("rejected above"),
                }
            }
            spec.insert(task.to_string(), task_inputs);
        }
        Ok(spec)
    }
}

impl Adapter for ManualAdapter {
    fn parse_inputs(&self, inputs: &RawInputs) -> Result<JobSpec> {
        // A configuration may spell the job specification out directly as a
        // mapping from task id to input name/value pairs.
        if !inputs.is_empty()
            && inputs.values().all(|value| matches!(value, RawValue::Map(_)))
        {
            let mut spec = JobSpec::new();
            for (task, value) in inputs {
                let RawValue::Map(map) = value else {
                    unreachable!("checked above");
                };
                let mut task_inputs = IndexMap::new();
                for (name, value) in map {
                    match value {
                        RawValue::One(s) => {
                            task_inputs.insert(name.clone(), s.clone());
                        }
                        _ => {
                            return Err(Error::config(format!(
                                "input `{name}` of task `{task}` must be a scalar"
                            )));
                        }
                    }
                }
                spec.insert(task.clone(), task_inputs);
            }
            return Ok(spec);
        }

        self.expand(inputs)
    }

    fn parse_outputs(&self, outputs: &OutputMap) {
        // The manual adapter hands outputs straight back to the caller.
        tracing::debug!("collected outputs for {} task(s)", outputs.len());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds raw inputs from name/value pairs.
    fn raw(pairs: &[(&str, RawValue)]) -> RawInputs {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    /// Shorthand for a scalar raw value.
    fn one(s: &str) -> RawValue {
        RawValue::One(s.to_string())
    }

    /// Shorthand for a list raw value.
    fn many(items: &[&str]) -> RawValue {
        RawValue::Many(items.iter().map(|s| one(s)).collect())
    }

    #[test]
    fn scalars_make_a_single_task() {
        let adapter = ManualAdapter { product: false };
        let spec = adapter
            .parse_inputs(&raw(&[("FOO", one("bar")), ("BAZ", one("qux"))]))
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec["0"]["FOO"], "bar");
        assert_eq!(spec["0"]["BAZ"], "qux");
    }

    #[test]
    fn lists_zip_and_scalars_broadcast() {
        let adapter = ManualAdapter { product: false };
        let spec = adapter
            .parse_inputs(&raw(&[("x", many(&["a", "b"])), ("y", one("c"))]))
            .unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec["0"]["x"], "a");
        assert_eq!(spec["1"]["x"], "b");
        assert_eq!(spec["1"]["y"], "c");
    }

    #[test]
    fn unequal_lists_are_rejected_without_product() {
        let adapter = ManualAdapter { product: false };
        let err = adapter
            .parse_inputs(&raw(&[("x", many(&["a", "b"])), ("y", many(&["c"]))]))
            .unwrap_err();
        assert!(err.to_string().contains("equal lengths"));
    }

    #[test]
    fn product_crosses_lists() {
        let adapter = ManualAdapter { product: true };
        let spec = adapter
            .parse_inputs(&raw(&[("x", many(&["a", "b"])), ("y", many(&["c", "d"]))]))
            .unwrap();
        assert_eq!(spec.len(), 4);
        // The last declared list varies fastest.
        assert_eq!(spec["0"]["x"], "a");
        assert_eq!(spec["0"]["y"], "c");
        assert_eq!(spec["1"]["x"], "a");
        assert_eq!(spec["1"]["y"], "d");
        assert_eq!(spec["3"]["x"], "b");
        assert_eq!(spec["3"]["y"], "d");
    }

    #[test]
    fn per_task_mappings_pass_through() {
        let adapter = ManualAdapter { product: false };
        let inputs = raw(&[(
            "0",
            RawValue::Map(raw(&[("FOO", one("bar"))])),
        )]);
        let spec = adapter.parse_inputs(&inputs).unwrap();
        assert_eq!(spec["0"]["FOO"], "bar");
    }

    #[test]
    fn empty_inputs_run_one_task() {
        let adapter = ManualAdapter { product: false };
        let spec = adapter.parse_inputs(&RawInputs::new()).unwrap();
        assert_eq!(spec.len(), 1);
        assert!(spec["0"].is_empty());
    }
}
