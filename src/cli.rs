//! The command line surface.
//!
//! A pipeline can come entirely from a YAML file, entirely from repeated
//! `key:value` options, or any mix: command line options merge with and
//! override the file on a per-key basis before the configuration is parsed.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use serde_yaml_ng::Mapping;
use serde_yaml_ng::Value;
use tracing_log::AsTrace;

use crate::config::Config;
use crate::config::yget;
use crate::config::yinsert;
use crate::config::yremove;
use crate::orchestrator::Orchestrator;

/// A `key:value` command line option.
#[derive(Debug, Clone)]
pub struct Spec {
    /// The key (everything before the first `:`).
    pub key: String,
    /// The value (everything after the first `:`).
    pub value: String,
}

/// Parses a `key:value` option.
fn parse_spec(s: &str) -> Result<Spec, String> {
    s.split_once(':')
        .map(|(key, value)| Spec {
            key: key.to_string(),
            value: value.to_string(),
        })
        .ok_or_else(|| format!("expected KEY:VALUE, got `{s}`"))
}

/// A `--localization` option: either a plain option or a per-input override.
#[derive(Debug, Clone)]
pub enum LocalizationSpec {
    /// A localizer option, `key:value`.
    Option(Spec),
    /// A per-input override, `overrides:INPUT:MODE`.
    Override {
        /// The input name the override applies to.
        input: String,
        /// The override mode.
        mode: String,
    },
}

/// Parses a `--localization` option.
fn parse_localization_spec(s: &str) -> Result<LocalizationSpec, String> {
    let spec = parse_spec(s)?;
    if spec.key == "overrides" {
        let (input, mode) = spec
            .value
            .split_once(':')
            .ok_or_else(|| format!("expected overrides:INPUT:MODE, got `{s}`"))?;
        Ok(LocalizationSpec::Override {
            input: input.to_string(),
            mode: mode.to_string(),
        })
    } else {
        Ok(LocalizationSpec::Option(spec))
    }
}

/// A SLURM job manager that schedules a script over an array of inputs.
#[derive(Debug, Parser)]
#[command(name = "canine", version, about)]
pub struct Cli {
    /// Path to a pipeline YAML file. Command line options merge with, and
    /// override, options in the file.
    #[arg(value_name = "PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Parse inputs and walk through localization, but never schedule the
    /// job. Everything is prepared and localized in the staging directory.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the final merged pipeline configuration to the given file.
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Name of the pipeline.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Path to the script to run.
    #[arg(short, long, value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Script inputs, as inputName:inputValue. May repeat; repeating an
    /// input name accumulates its values into a list.
    #[arg(short = 'i', long = "input", value_name = "NAME:VALUE", value_parser = parse_spec)]
    pub inputs: Vec<Spec>,

    /// SLURM arguments, as argName:argValue, without leading dashes. For
    /// SLURM options which take no argument, use argName:true.
    #[arg(short = 'r', long = "resources", value_name = "NAME:VALUE", value_parser = parse_spec)]
    pub resources: Vec<Spec>,

    /// Adapter options, as optionName:optionValue.
    #[arg(short = 'a', long = "adapter", value_name = "NAME:VALUE", value_parser = parse_spec)]
    pub adapter: Vec<Spec>,

    /// Backend options, as optionName:optionValue.
    #[arg(short = 'b', long = "backend", value_name = "NAME:VALUE", value_parser = parse_spec)]
    pub backend: Vec<Spec>,

    /// Localization options, as optionName:optionValue. Per-input overrides
    /// use the form overrides:inputName:mode.
    #[arg(
        short = 'l',
        long = "localization",
        value_name = "NAME:VALUE",
        value_parser = parse_localization_spec
    )]
    pub localization: Vec<LocalizationSpec>,

    /// Output patterns, as outputName:globPattern.
    #[arg(short = 'o', long = "output", value_name = "NAME:PATTERN", value_parser = parse_spec)]
    pub outputs: Vec<Spec>,

    /// Logging verbosity.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Merges plain `key:value` options into a configuration subtree.
fn merge_specs(conf: &mut Mapping, key: &str, specs: &[Spec]) {
    if specs.is_empty() {
        return;
    }
    let mut subtree = match yremove(conf, key) {
        Some(Value::Mapping(map)) => map,
        _ => Mapping::new(),
    };
    for spec in specs {
        yinsert(&mut subtree, &spec.key, Value::from(spec.value.clone()));
    }
    yinsert(conf, key, Value::Mapping(subtree));
}

/// Merges command line options into the configuration mapping.
pub(crate) fn merge_config(cli: &Cli, conf: &mut Mapping) {
    if let Some(name) = &cli.name {
        yinsert(conf, "name", Value::from(name.clone()));
    }
    if let Some(script) = &cli.script {
        yinsert(
            conf,
            "script",
            Value::from(script.to_string_lossy().into_owned()),
        );
    }
    merge_specs(conf, "resources", &cli.resources);
    merge_specs(conf, "adapter", &cli.adapter);
    merge_specs(conf, "backend", &cli.backend);

    // Outputs only merge when the file declared none.
    if !cli.outputs.is_empty() && yget(conf, "outputs").is_none() {
        let mut outputs = Mapping::new();
        for spec in &cli.outputs {
            yinsert(&mut outputs, &spec.key, Value::from(spec.value.clone()));
        }
        yinsert(conf, "outputs", Value::Mapping(outputs));
    }

    // Inputs accumulate: a repeated name extends any existing value (from
    // the file or from earlier occurrences) into a list.
    if !cli.inputs.is_empty() {
        let mut inputs = match yremove(conf, "inputs") {
            Some(Value::Mapping(map)) => map,
            _ => Mapping::new(),
        };
        for spec in &cli.inputs {
            let value = Value::from(spec.value.clone());
            match yremove(&mut inputs, &spec.key) {
                Some(Value::Sequence(mut prev)) => {
                    prev.push(value);
                    yinsert(&mut inputs, &spec.key, Value::Sequence(prev));
                }
                Some(prev) => {
                    yinsert(&mut inputs, &spec.key, Value::Sequence(vec![prev, value]));
                }
                None => {
                    yinsert(&mut inputs, &spec.key, value);
                }
            }
        }
        yinsert(conf, "inputs", Value::Mapping(inputs));
    }

    if !cli.localization.is_empty() {
        let mut localization = match yremove(conf, "localization") {
            Some(Value::Mapping(map)) => map,
            _ => Mapping::new(),
        };
        let mut overrides = match yremove(&mut localization, "overrides") {
            Some(Value::Mapping(map)) => map,
            _ => Mapping::new(),
        };
        for spec in &cli.localization {
            match spec {
                LocalizationSpec::Option(spec) => {
                    yinsert(&mut localization, &spec.key, Value::from(spec.value.clone()));
                }
                LocalizationSpec::Override { input, mode } => {
                    yinsert(&mut overrides, input, Value::from(mode.clone()));
                }
            }
        }
        if !overrides.is_empty() {
            yinsert(&mut localization, "overrides", Value::Mapping(overrides));
        }
        yinsert(conf, "localization", Value::Mapping(localization));
    }
}

/// Runs the CLI to completion.
///
/// Per-task failures do not fail the run; only orchestration errors do.
async fn run(cli: Cli) -> Result<()> {
    let mut conf = match &cli.pipeline {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| {
                format!("failed to read pipeline file `{path}`", path = path.display())
            })?;
            match serde_yaml_ng::from_str(&text)? {
                Value::Mapping(map) => map,
                Value::Null => Mapping::new(),
                _ => bail!("the pipeline file must be a YAML mapping"),
            }
        }
        None => Mapping::new(),
    };
    merge_config(&cli, &mut conf);

    if let Some(path) = &cli.export {
        let text = serde_yaml_ng::to_string(&Value::Mapping(conf.clone()))?;
        std::fs::write(path, text).with_context(|| {
            format!("failed to export the pipeline to `{path}`", path = path.display())
        })?;
    }

    let config = Config::from_value(Value::Mapping(conf))?;
    let mut orchestrator = Orchestrator::new(config)?;
    let outcome = orchestrator.run_pipeline(cli.dry_run).await?;
    if let Some(batch_id) = &outcome.batch_id {
        println!("Batch id: {batch_id}");
        if let Some(acct) = &outcome.acct {
            print!("{acct}");
        }
    }
    Ok(())
}

/// Parses arguments, installs logging, and runs the CLI.
pub async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("error: failed to install the logger: {e}");
        return std::process::ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Parses CLI arguments and merges them over the given YAML text.
    fn merged(args: &[&str], yaml: &str) -> Mapping {
        let cli = Cli::parse_from([&["canine"], args].concat());
        let mut conf = match serde_yaml_ng::from_str(yaml).unwrap() {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            other => panic!("unexpected test yaml: {other:?}"),
        };
        merge_config(&cli, &mut conf);
        conf
    }

    #[test]
    fn cli_inputs_accumulate_with_file_inputs() {
        let conf = merged(&["-i", "x:b"], "inputs:\n  x: a\n");
        assert_eq!(
            yget(&conf, "inputs").unwrap(),
            &serde_yaml_ng::from_str::<Value>("x: [a, b]").unwrap()
        );
    }

    #[test]
    fn repeated_cli_inputs_become_a_list() {
        let conf = merged(&["-i", "x:b", "-i", "x:c"], "");
        assert_eq!(
            yget(&conf, "inputs").unwrap(),
            &serde_yaml_ng::from_str::<Value>("x: [b, c]").unwrap()
        );
    }

    #[test]
    fn single_cli_input_stays_scalar() {
        let conf = merged(&["-i", "x:b"], "");
        assert_eq!(
            yget(&conf, "inputs").unwrap(),
            &serde_yaml_ng::from_str::<Value>("x: b").unwrap()
        );
    }

    #[test]
    fn cli_outputs_only_merge_when_the_file_has_none() {
        let conf = merged(&["-o", "log:stdout"], "");
        assert_eq!(
            yget(&conf, "outputs").unwrap(),
            &serde_yaml_ng::from_str::<Value>("log: stdout").unwrap()
        );

        let conf = merged(&["-o", "log:stdout"], "outputs:\n  data: '*.txt'\n");
        assert_eq!(
            yget(&conf, "outputs").unwrap(),
            &serde_yaml_ng::from_str::<Value>("data: '*.txt'").unwrap()
        );
    }

    #[test]
    fn resource_options_override_per_key() {
        let conf = merged(
            &["-r", "partition:debug"],
            "resources:\n  partition: main\n  cpus-per-task: 2\n",
        );
        assert_eq!(
            yget(&conf, "resources").unwrap(),
            &serde_yaml_ng::from_str::<Value>("partition: debug\ncpus-per-task: 2\n").unwrap()
        );
    }

    #[test]
    fn localization_overrides_nest() {
        let conf = merged(
            &["-l", "common:false", "-l", "overrides:src:stream"],
            "localization:\n  overrides:\n    other: delayed\n",
        );
        let expected: Value = serde_yaml_ng::from_str(
            "overrides:\n  other: delayed\n  src: stream\ncommon: 'false'\n",
        )
        .unwrap();
        assert_eq!(yget(&conf, "localization").unwrap(), &expected);
    }

    #[test]
    fn values_keep_their_colons() {
        let cli = Cli::parse_from(["canine", "-i", "url:gs://bucket/obj"]);
        assert_eq!(cli.inputs[0].key, "url");
        assert_eq!(cli.inputs[0].value, "gs://bucket/obj");
    }
}
