//! Command-line overlays for flat configuration objects.
//!
//! Every field of the configuration becomes a `--<field>` flag typed after its
//! default value. Parsed strings are then coerced with
//! [`forneus_core::literal_eval`], so `--lr 2e-4` or `--layers "[1, 2]"` arrive
//! as numbers and lists even for fields whose default is a string or `None`.

use std::ffi::OsString;
use std::path::Path;

use clap::{value_parser, Arg, ArgMatches, Command};
use forneus_core::value::ValueKind;
use forneus_core::{literal_eval, ConfigMap, ConfigValue, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Description shown at the top of `--help`.
pub const ABOUT: &str = "Run training baseline";

/// Errors from parsing command-line overrides.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    /// Usage error, or a `--help` request.
    #[error(transparent)]
    Usage(#[from] clap::Error),

    /// The configuration could not be read or written back.
    #[error(transparent)]
    Config(#[from] Error),
}

/// Parses a boolean flag value, accepting `true` and `false` in any case.
///
/// # Errors
///
/// Returns a message naming the expectation for any other input.
pub fn str2bool(v: &str) -> Result<bool, String> {
    if v.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if v.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err("Boolean value expected.".to_string())
    }
}

/// Builds the command for a configuration: one `--<field>` flag per entry.
#[must_use]
pub fn command(name: impl Into<String>, config: &ConfigMap) -> Command {
    config
        .iter()
        .fold(Command::new(name.into()).about(ABOUT), |cmd, (field, default)| {
            cmd.arg(field_arg(field, default))
        })
}

fn field_arg(field: &str, default: &ConfigValue) -> Arg {
    let arg = Arg::new(field.to_string())
        .long(field.to_string())
        .value_name(field.to_uppercase())
        .help(format!("Default: {default}"));
    match default.kind() {
        ValueKind::Bool => arg.value_parser(str2bool),
        ValueKind::Int => arg
            .value_parser(value_parser!(i64))
            .allow_negative_numbers(true),
        ValueKind::Float => arg
            .value_parser(value_parser!(f64))
            .allow_negative_numbers(true),
        ValueKind::Str | ValueKind::None | ValueKind::List => {
            arg.value_parser(value_parser!(String))
        }
    }
}

/// One field after parsing.
#[derive(Debug, Clone, PartialEq)]
struct Resolved {
    name: String,
    /// The override as given (or the default), before coercion.
    raw: ConfigValue,
    /// The value after literal coercion.
    coerced: ConfigValue,
}

fn matched_value(matches: &ArgMatches, field: &str, default: &ConfigValue) -> Option<ConfigValue> {
    match default.kind() {
        ValueKind::Bool => matches.get_one::<bool>(field).copied().map(ConfigValue::Bool),
        ValueKind::Int => matches.get_one::<i64>(field).copied().map(ConfigValue::Int),
        ValueKind::Float => matches.get_one::<f64>(field).copied().map(ConfigValue::Float),
        ValueKind::Str | ValueKind::None | ValueKind::List => matches
            .get_one::<String>(field)
            .cloned()
            .map(ConfigValue::Str),
    }
}

fn coerce(raw: &ConfigValue) -> ConfigValue {
    match raw {
        ConfigValue::Str(s) => literal_eval(s).unwrap_or_else(|| raw.clone()),
        other => other.clone(),
    }
}

fn program_name(first: Option<&OsString>) -> String {
    first
        .and_then(|arg| Path::new(arg).file_name())
        .map_or_else(|| "forneus".to_string(), |n| n.to_string_lossy().into_owned())
}

fn resolve_from<I, T>(defaults: &ConfigMap, args: I) -> Result<Vec<Resolved>, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let matches = command(program_name(args.first()), defaults).try_get_matches_from(args)?;

    Ok(defaults
        .iter()
        .map(|(field, default)| {
            let raw = matched_value(&matches, field, default).unwrap_or_else(|| default.clone());
            let coerced = coerce(&raw);
            Resolved {
                name: field.to_string(),
                raw,
                coerced,
            }
        })
        .collect())
}

fn print_config(resolved: &[Resolved]) {
    println!("Running with the following config");
    for field in resolved {
        println!("--{}:{}", field.name, field.raw);
    }
}

/// Writes resolved values back through serde.
///
/// A coerced value that the target type rejects falls back to the raw string
/// for that field.
fn write_back<C: DeserializeOwned>(defaults: &ConfigMap, resolved: &[Resolved]) -> Result<C, Error> {
    let base = defaults.to_json_map();
    let mut chosen = Map::new();
    for field in resolved {
        let mut value = field.coerced.to_json();
        if field.coerced != field.raw {
            let mut candidate = base.clone();
            candidate.insert(field.name.clone(), value.clone());
            if serde_json::from_value::<C>(Value::Object(candidate)).is_err() {
                debug!(field = %field.name, "Coerced override rejected, keeping the string");
                value = field.raw.to_json();
            }
        }
        chosen.insert(field.name.clone(), value);
    }
    serde_json::from_value(Value::Object(chosen))
        .map_err(|e| Error::invalid_config(format!("cannot apply overrides: {e}")))
}

/// Parses `args` (program name first) against a configuration map and writes
/// the coerced values back into it.
///
/// # Errors
///
/// Returns [`ArgError::Usage`] for unknown flags, bad typed values and `--help`.
pub fn try_parse_map_from<I, T>(config: &mut ConfigMap, args: I) -> Result<(), ArgError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let resolved = resolve_from(config, args)?;
    print_config(&resolved);
    for field in resolved {
        config.insert(field.name, field.coerced);
    }
    Ok(())
}

/// Parses `args` (program name first) against a flat serde struct and replaces
/// it with the overridden configuration.
///
/// # Errors
///
/// Returns [`ArgError::Usage`] for unknown flags, bad typed values and `--help`,
/// and [`ArgError::Config`] if the struct is not flat or rejects an override.
pub fn try_parse_args_from<C, I, T>(config: &mut C, args: I) -> Result<(), ArgError>
where
    C: Serialize + DeserializeOwned,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let defaults = ConfigMap::from_serialize(&*config)?;
    let resolved = resolve_from(&defaults, args)?;
    print_config(&resolved);
    *config = write_back(&defaults, &resolved)?;
    Ok(())
}

/// Parses the process arguments into `config`.
///
/// Usage errors and `--help` print and exit the process the way clap does.
///
/// # Errors
///
/// Returns [`ArgError::Config`] if the overrides cannot be written back.
pub fn parse_args<C>(config: &mut C) -> Result<(), ArgError>
where
    C: Serialize + DeserializeOwned,
{
    match try_parse_args_from(config, std::env::args_os()) {
        Err(ArgError::Usage(e)) => e.exit(),
        other => other,
    }
}
