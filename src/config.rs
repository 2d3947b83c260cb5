//! Pipeline configuration records.
//!
//! A pipeline arrives as YAML (optionally merged with command line options)
//! and is parsed here into explicit option records. Scalars are stringified on
//! load: SLURM flags, input values, and glob patterns are all shell-facing
//! strings regardless of how YAML typed them.

use indexmap::IndexMap;
use serde_yaml_ng::Mapping;
use serde_yaml_ng::Value;

use crate::error::Error;
use crate::error::Result;

/// The default name given to unnamed pipelines.
const DEFAULT_NAME: &str = "canine";

/// The default directory outputs are delocalized into on the invoking host.
pub const DEFAULT_OUTPUT_DIR: &str = "canine_output";

/// A stringified configuration value: a scalar, a list, or a nested mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    /// A single scalar value.
    One(String),
    /// A list of values.
    Many(Vec<RawValue>),
    /// A nested mapping of values.
    Map(IndexMap<String, RawValue>),
}

/// The raw, pre-adapter input mapping from input name to value.
pub type RawInputs = IndexMap<String, RawValue>;

/// A fully expanded job specification: task id to input name to value.
pub type JobSpec = IndexMap<String, IndexMap<String, String>>;

/// Per-input localization override modes, keyed by input name.
///
/// `None` is the explicit `null` override: the value passes through verbatim.
pub type Overrides = IndexMap<String, Option<String>>;

/// The user script to run for every task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// A path to an existing shell script.
    Path(String),
    /// An ordered list of shell lines to pack into a script.
    Lines(Vec<String>),
}

/// Options controlling the localizer.
#[derive(Debug, Clone)]
pub struct LocalizationOptions {
    /// Whether `gs://` inputs are copied to the staging area by the
    /// controller. When disabled, cloud URIs pass through verbatim.
    pub localize_gs: bool,
    /// Whether inputs shared by two or more tasks are deduplicated into the
    /// common directory.
    pub common: bool,
    /// The staging directory on the controller. A random name is chosen when
    /// absent.
    pub staging_dir: Option<String>,
    /// The path at which workers see the staging directory. Defaults to the
    /// staging directory itself (a shared filesystem mounted at equal paths).
    pub mount_path: Option<String>,
    /// The directory on the invoking host that outputs are delocalized into.
    pub output_dir: String,
}

impl Default for LocalizationOptions {
    fn default() -> Self {
        Self {
            localize_gs: true,
            common: true,
            staging_dir: None,
            mount_path: None,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
        }
    }
}

/// Options for the adapter that expands raw inputs into a job specification.
#[derive(Debug, Clone)]
pub enum AdapterOptions {
    /// The manual adapter: input lists fan out into tasks directly.
    Manual {
        /// When set, list-valued inputs combine as a cross product instead of
        /// zipping index-by-index.
        product: bool,
    },
}

impl AdapterOptions {
    /// The registry tag this adapter was configured with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "Manual",
        }
    }
}

/// Options for the remote (SSH) backend.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// The host to connect to; also the lookup key into `~/.ssh/config`.
    pub host: String,
    /// The user to authenticate as. Falls back to `~/.ssh/config`, then to
    /// `$USER`.
    pub user: Option<String>,
    /// The port to connect to. Falls back to `~/.ssh/config`, then to 22.
    pub port: Option<u16>,
    /// The private key to authenticate with. Falls back to `~/.ssh/config`,
    /// then to `~/.ssh/id_rsa`.
    pub key_file: Option<String>,
    /// A password to authenticate with instead of a key.
    pub password: Option<String>,
}

/// Options for the transient container-hosted cluster backend.
#[derive(Debug, Clone)]
pub struct TransientOptions {
    /// The number of worker containers the controller is expected to start.
    pub n_workers: usize,
    /// The bridge network joining the controller and workers.
    pub network: String,
    /// CPUs granted to each worker.
    pub cpus: Option<u32>,
    /// Memory granted to each worker.
    pub memory: Option<String>,
    /// A script dispatched on every worker once the cluster is up.
    pub compute_script: String,
    /// A script dispatched on the controller once the cluster is up.
    pub controller_script: String,
    /// The container image for the controller and workers.
    pub image: String,
}

/// Options for the configured execution backend, keyed by registry tag.
#[derive(Debug, Clone)]
pub enum BackendOptions {
    /// The host process is the SLURM controller.
    Local,
    /// A SLURM controller reached over SSH.
    Remote(RemoteOptions),
    /// An ephemeral container-hosted cluster on the local host.
    Transient(TransientOptions),
}

impl BackendOptions {
    /// The registry tag this backend was configured with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Remote(_) => "Remote",
            Self::Transient(_) => "TransientGCP",
        }
    }
}

/// A fully parsed pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The pipeline name.
    pub name: String,
    /// The user script.
    pub script: ScriptSource,
    /// Raw inputs, prior to adapter expansion.
    pub inputs: RawInputs,
    /// SLURM resource flags passed through to `sbatch`. A value of `true`
    /// renders as a bare boolean flag.
    pub resources: IndexMap<String, String>,
    /// Adapter selection and options.
    pub adapter: AdapterOptions,
    /// Backend selection and options.
    pub backend: BackendOptions,
    /// Localizer options, with `overrides` already split out.
    pub localization: LocalizationOptions,
    /// Per-input localization overrides, handed to planning separately from
    /// the localizer constructor options.
    pub overrides: Overrides,
    /// Output name to glob pattern mapping.
    pub outputs: IndexMap<String, String>,
}

impl Config {
    /// Parses a pipeline configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Self::from_value(serde_yaml_ng::from_str(text)?)
    }

    /// Parses a pipeline configuration from a YAML value, applying defaults.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(Error::config("pipeline configuration must be a mapping")),
        };

        let name = match yget(&map, "name") {
            Some(value) => scalar_to_string(value)
                .ok_or_else(|| Error::config("`name` must be a scalar"))?,
            None => DEFAULT_NAME.to_string(),
        };

        let script = match yget(&map, "script") {
            Some(Value::String(path)) => ScriptSource::Path(path.clone()),
            Some(Value::Sequence(lines)) => ScriptSource::Lines(
                lines
                    .iter()
                    .map(|line| {
                        scalar_to_string(line)
                            .ok_or_else(|| Error::config("`script` lines must be scalars"))
                    })
                    .collect::<Result<_>>()?,
            ),
            Some(_) => {
                return Err(Error::config(
                    "`script` must be a path to a bash script or a list of bash commands",
                ));
            }
            None => return Err(Error::config("missing required key `script`")),
        };

        let inputs = match yget(&map, "inputs") {
            Some(Value::Mapping(inputs)) => mapping_to_raw(inputs)?,
            Some(_) => return Err(Error::config("`inputs` must be a mapping")),
            None => RawInputs::new(),
        };

        let resources = match yget(&map, "resources") {
            Some(value) => string_map(value, "resources")?,
            None => IndexMap::new(),
        };

        let outputs = match yget(&map, "outputs") {
            Some(value) => string_map(value, "outputs")?,
            None => IndexMap::new(),
        };
        if outputs.is_empty() {
            tracing::warn!("no outputs declared");
        }

        let adapter = AdapterOptions::from_value(yget(&map, "adapter"))?;
        let backend = BackendOptions::from_value(yget(&map, "backend"))?;

        // `localization.overrides` travels with the localization subtree in
        // the configuration and is split out here; the rest of the subtree
        // configures the localizer itself.
        let mut localization_map = match yremove(&mut map, "localization") {
            Some(Value::Mapping(map)) => map,
            Some(_) => return Err(Error::config("`localization` must be a mapping")),
            None => Mapping::new(),
        };
        let overrides = match yremove(&mut localization_map, "overrides") {
            Some(Value::Mapping(map)) => parse_overrides(&map)?,
            Some(Value::Null) | None => Overrides::new(),
            Some(_) => return Err(Error::config("`localization.overrides` must be a mapping")),
        };
        let localization = LocalizationOptions::from_mapping(&localization_map)?;

        Ok(Self {
            name,
            script,
            inputs,
            resources,
            adapter,
            backend,
            localization,
            overrides,
            outputs,
        })
    }
}

impl AdapterOptions {
    /// Parses the `adapter` subtree, defaulting to the manual adapter.
    fn from_value(value: Option<&Value>) -> Result<Self> {
        let map = match value {
            Some(Value::Mapping(map)) => map.clone(),
            Some(_) => return Err(Error::config("`adapter` must be a mapping")),
            None => Mapping::new(),
        };
        let tag = match yget(&map, "type") {
            Some(value) => scalar_to_string(value)
                .ok_or_else(|| Error::config("`adapter.type` must be a scalar"))?,
            None => "Manual".to_string(),
        };
        match tag.as_str() {
            "Manual" => {
                let mut product = false;
                for (key, value) in &map {
                    match key_string(key)?.as_str() {
                        "type" => {}
                        "product" => product = value_to_bool(value, "adapter.product")?,
                        other => {
                            return Err(Error::config(format!("unknown adapter option `{other}`")));
                        }
                    }
                }
                Ok(Self::Manual { product })
            }
            other => Err(Error::config(format!("unknown adapter type '{other}'"))),
        }
    }
}

impl BackendOptions {
    /// Parses the `backend` subtree, defaulting to the local backend.
    fn from_value(value: Option<&Value>) -> Result<Self> {
        let map = match value {
            Some(Value::Mapping(map)) => map.clone(),
            Some(_) => return Err(Error::config("`backend` must be a mapping")),
            None => Mapping::new(),
        };
        let tag = match yget(&map, "type") {
            Some(value) => scalar_to_string(value)
                .ok_or_else(|| Error::config("`backend.type` must be a scalar"))?,
            None => "Local".to_string(),
        };
        match tag.as_str() {
            "Local" => {
                for (key, _) in &map {
                    let key = key_string(key)?;
                    if key != "type" {
                        return Err(Error::config(format!("unknown backend option `{key}`")));
                    }
                }
                Ok(Self::Local)
            }
            "Remote" => {
                let mut options = RemoteOptions {
                    host: String::new(),
                    user: None,
                    port: None,
                    key_file: None,
                    password: None,
                };
                for (key, value) in &map {
                    match key_string(key)?.as_str() {
                        "type" => {}
                        "host" | "hostname" => {
                            options.host = value_to_string(value, "backend.host")?;
                        }
                        "user" => options.user = Some(value_to_string(value, "backend.user")?),
                        "port" => {
                            options.port =
                                Some(value_to_number(value, "backend.port")? as u16);
                        }
                        "key_file" => {
                            options.key_file =
                                Some(value_to_string(value, "backend.key_file")?);
                        }
                        "password" => {
                            options.password =
                                Some(value_to_string(value, "backend.password")?);
                        }
                        other => {
                            return Err(Error::config(format!("unknown backend option `{other}`")));
                        }
                    }
                }
                if options.host.is_empty() {
                    return Err(Error::config("remote backend requires `host`"));
                }
                Ok(Self::Remote(options))
            }
            "TransientGCP" => {
                let mut options = TransientOptions {
                    n_workers: 1,
                    network: "canine_dummy_slurm".to_string(),
                    cpus: None,
                    memory: None,
                    compute_script: String::new(),
                    controller_script: String::new(),
                    image: "gcr.io/broad-cga-aarong-gtex/slurmind".to_string(),
                };
                for (key, value) in &map {
                    match key_string(key)?.as_str() {
                        "type" => {}
                        "n_workers" => {
                            options.n_workers =
                                value_to_number(value, "backend.n_workers")? as usize;
                        }
                        "network" => {
                            options.network = value_to_string(value, "backend.network")?;
                        }
                        "cpus" => {
                            options.cpus = Some(value_to_number(value, "backend.cpus")? as u32);
                        }
                        "memory" => {
                            options.memory = Some(value_to_string(value, "backend.memory")?);
                        }
                        "compute_script" => {
                            options.compute_script =
                                value_to_string(value, "backend.compute_script")?;
                        }
                        "controller_script" => {
                            options.controller_script =
                                value_to_string(value, "backend.controller_script")?;
                        }
                        "image" => options.image = value_to_string(value, "backend.image")?,
                        other => {
                            return Err(Error::config(format!("unknown backend option `{other}`")));
                        }
                    }
                }
                if options.network.contains('-') {
                    return Err(Error::config("network name cannot contain '-'"));
                }
                Ok(Self::Transient(options))
            }
            other => Err(Error::config(format!("unknown backend type '{other}'"))),
        }
    }
}

impl LocalizationOptions {
    /// Parses the `localization` subtree (after `overrides` was split out).
    fn from_mapping(map: &Mapping) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key_string(key)?.as_str() {
                "localize_gs" => {
                    options.localize_gs = value_to_bool(value, "localization.localize_gs")?;
                }
                "common" => options.common = value_to_bool(value, "localization.common")?,
                "staging_dir" => {
                    options.staging_dir =
                        Some(value_to_string(value, "localization.staging_dir")?);
                }
                "mount_path" => {
                    options.mount_path =
                        Some(value_to_string(value, "localization.mount_path")?);
                }
                "output_dir" => {
                    options.output_dir = value_to_string(value, "localization.output_dir")?;
                }
                other => {
                    return Err(Error::config(format!("unknown localization option `{other}`")));
                }
            }
        }
        Ok(options)
    }
}

/// Looks a string key up in a YAML mapping.
pub(crate) fn yget<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::from(key))
}

/// Removes a string key from a YAML mapping.
pub(crate) fn yremove(map: &mut Mapping, key: &str) -> Option<Value> {
    map.remove(&Value::from(key))
}

/// Inserts a string-keyed entry into a YAML mapping.
pub(crate) fn yinsert(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::from(key), value);
}

/// Stringifies a scalar YAML value; returns `None` for collections.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

/// Converts a YAML mapping key to a string, rejecting collection keys.
fn key_string(key: &Value) -> Result<String> {
    scalar_to_string(key).ok_or_else(|| Error::config("mapping keys must be scalars"))
}

/// Recursively stringifies a YAML value.
fn value_to_raw(value: &Value) -> Result<RawValue> {
    match value {
        Value::Sequence(seq) => Ok(RawValue::Many(
            seq.iter().map(value_to_raw).collect::<Result<_>>()?,
        )),
        Value::Mapping(map) => Ok(RawValue::Map(mapping_to_raw(map)?)),
        other => scalar_to_string(other)
            .map(RawValue::One)
            .ok_or_else(|| Error::config("unsupported value in `inputs`")),
    }
}

/// Stringifies a YAML mapping into raw input values.
fn mapping_to_raw(map: &Mapping) -> Result<IndexMap<String, RawValue>> {
    let mut out = IndexMap::new();
    for (key, value) in map {
        out.insert(key_string(key)?, value_to_raw(value)?);
    }
    Ok(out)
}

/// Parses a mapping of scalar values into an ordered string map.
fn string_map(value: &Value, what: &str) -> Result<IndexMap<String, String>> {
    let map = match value {
        Value::Mapping(map) => map,
        _ => return Err(Error::config(format!("`{what}` must be a mapping"))),
    };
    let mut out = IndexMap::new();
    for (key, value) in map {
        let value = scalar_to_string(value)
            .ok_or_else(|| Error::config(format!("`{what}` values must be scalars")))?;
        out.insert(key_string(key)?, value);
    }
    Ok(out)
}

/// Parses the `overrides` mapping. String values carry the override mode;
/// anything else is the explicit `null` (pass through verbatim) mode.
fn parse_overrides(map: &Mapping) -> Result<Overrides> {
    let mut out = Overrides::new();
    for (key, value) in map {
        let mode = match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        };
        out.insert(key_string(key)?, mode);
    }
    Ok(out)
}

/// Requires a scalar value, stringified.
fn value_to_string(value: &Value, what: &str) -> Result<String> {
    scalar_to_string(value).ok_or_else(|| Error::config(format!("`{what}` must be a scalar")))
}

/// Parses a boolean from a YAML bool or its common string spellings.
fn value_to_bool(value: &Value, what: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(Error::config(format!("`{what}` must be a boolean"))),
        },
        _ => Err(Error::config(format!("`{what}` must be a boolean"))),
    }
}

/// Parses an unsigned integer from a YAML number or numeric string.
fn value_to_number(value: &Value, what: &str) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::config(format!("`{what}` must be an unsigned integer")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_yaml_str("script: [echo hi]").unwrap();
        assert_eq!(config.name, "canine");
        assert!(matches!(config.adapter, AdapterOptions::Manual { product: false }));
        assert!(matches!(config.backend, BackendOptions::Local));
        assert!(config.localization.common);
        assert!(config.localization.localize_gs);
        assert_eq!(config.localization.output_dir, DEFAULT_OUTPUT_DIR);
    }

    #[test]
    fn script_is_required() {
        let err = Config::from_yaml_str("name: x").unwrap_err();
        assert!(err.to_string().contains("script"));
    }

    #[test]
    fn script_must_be_path_or_lines() {
        let err = Config::from_yaml_str("script: 42").unwrap_err();
        assert!(err.to_string().contains("script"));
    }

    #[test]
    fn scalars_stringify() {
        let config = Config::from_yaml_str(
            "script: [true]\ninputs:\n  n: 4\n  flag: true\nresources:\n  cpus-per-task: 2\n",
        )
        .unwrap();
        assert_eq!(config.inputs["n"], RawValue::One("4".to_string()));
        assert_eq!(config.inputs["flag"], RawValue::One("true".to_string()));
        assert_eq!(config.resources["cpus-per-task"], "2");
    }

    #[test]
    fn overrides_split_from_localization() {
        let config = Config::from_yaml_str(
            "script: [echo]\nlocalization:\n  common: false\n  overrides:\n    src: stream\n    lit: null\n",
        )
        .unwrap();
        assert!(!config.localization.common);
        assert_eq!(config.overrides["src"], Some("stream".to_string()));
        assert_eq!(config.overrides["lit"], None);
    }

    #[test]
    fn unknown_backend_tag_is_an_error() {
        let err = Config::from_yaml_str("script: [echo]\nbackend:\n  type: Slinky\n").unwrap_err();
        assert!(err.to_string().contains("unknown backend type"));
    }

    #[test]
    fn unknown_option_key_is_an_error() {
        let err =
            Config::from_yaml_str("script: [echo]\nlocalization:\n  staging: /tmp\n").unwrap_err();
        assert!(err.to_string().contains("unknown localization option"));
    }

    #[test]
    fn bools_parse_from_strings() {
        let config = Config::from_yaml_str(
            "script: [echo]\nlocalization:\n  localize_gs: 'false'\n",
        )
        .unwrap();
        assert!(!config.localization.localize_gs);
    }

    #[test]
    fn transient_network_rejects_dashes() {
        let err = Config::from_yaml_str(
            "script: [echo]\nbackend:\n  type: TransientGCP\n  network: my-net\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot contain '-'"));
    }

    #[test]
    fn remote_requires_host() {
        let err = Config::from_yaml_str("script: [echo]\nbackend:\n  type: Remote\n").unwrap_err();
        assert!(err.to_string().contains("host"));
    }
}
