//! `${VAR}` and `${VAR:-default}` expansion for configuration text.

use anyhow::{bail, Result};
use regex::Regex;
use std::env;

/// Expand environment references. Every unset variable without a default is
/// reported in one error.
pub fn expand_env(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")?;
    let mut out = String::with_capacity(input.len());
    let mut missing = Vec::new();
    let mut last = 0;

    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(name) = caps.get(1) else { continue };
        out.push_str(&input[last..whole.start()]);
        match env::var(name.as_str()) {
            Ok(value) => out.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => missing.push(name.as_str()),
            },
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);

    if !missing.is_empty() {
        bail!("missing environment variable(s): {}", missing.join(", "));
    }
    Ok(out)
}
