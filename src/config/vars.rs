//! Environment variable interpolation for config files.
//!
//! Supported syntax:
//! - `$VAR` or `${VAR}`: the variable's value; an error if it is unset
//! - `${VAR:-default}`: `default` when VAR is unset or empty
//! - `${VAR-default}`: `default` only when VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("valid interpolation regex")
});

/// Interpolate environment variables in `input`.
///
/// Every problem is collected so a user sees all missing variables at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        match resolve(caps, |name| env::var(name).ok()) {
            Ok(value) => value,
            Err(message) => {
                errors.push(message);
                caps[0].to_string()
            }
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}

/// Resolve one match using `lookup` to read variables.
fn resolve(caps: &Captures, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    if caps.name("escape").is_some() {
        return Ok("$".to_string());
    }

    let name = caps
        .name("braced")
        .or_else(|| caps.name("bare"))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let default = caps.name("default").map(|m| m.as_str());
    let default_when_empty = caps.name("op").is_some_and(|op| op.as_str() == ":-");

    match lookup(name) {
        Some(value) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        Some(value) if value.is_empty() && default_when_empty => {
            Ok(default.unwrap_or_default().to_string())
        }
        Some(value) => Ok(value),
        None => default
            .map(str::to_string)
            .ok_or_else(|| format!("environment variable '{name}' is not set")),
    }
}
