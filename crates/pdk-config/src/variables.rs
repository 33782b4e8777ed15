//! Layered variable resolution and string interpolation.
//!
//! Resolution checks four layers, highest precedence first:
//!
//! 1. CLI overrides (`--var KEY=VALUE`, `--var-file`)
//! 2. Process environment (including `PDK_VAR_*` under their bare names)
//! 3. Configuration file variables
//! 4. Built-ins (`PDK_VERSION`, `PDK_WORKSPACE`, `PDK_JOB`, `TIMESTAMP`, ...)
//!
//! Supported references inside strings:
//! - `${NAME}` and `$NAME` — resolved value; unresolved stays literal with
//!   a warning
//! - `${NAME:-default}` — default when unset or empty
//! - `${NAME:?message}` — hard failure when unset
//! - `\${...}` — literal, the backslash is consumed

use std::collections::BTreeMap;

use pdk_core::error::{Error, Result};

/// Environment prefix that surfaces user variables.
pub const VAR_PREFIX: &str = "PDK_VAR_";
/// Environment prefix that surfaces user secrets.
pub const SECRET_PREFIX: &str = "PDK_SECRET_";

/// Recursion/round cap for the expander. Exceeding it means the
/// definitions reference each other.
const MAX_DEPTH: usize = 10;

/// Result of expanding one string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub value: String,
    /// One entry per unresolved plain reference, in order of appearance.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    cli: BTreeMap<String, String>,
    process_env: BTreeMap<String, String>,
    config: BTreeMap<String, String>,
    builtins: BTreeMap<String, String>,
    /// Secret values surfaced from `PDK_SECRET_*` and `--secret`; they
    /// resolve like variables and must be registered with the masker.
    secrets: BTreeMap<String, String>,
}

impl VariableResolver {
    /// Build a resolver from the configuration layer and CLI overrides,
    /// capturing the current process environment.
    pub fn new(config: BTreeMap<String, String>, cli: BTreeMap<String, String>) -> Self {
        let mut resolver = Self {
            cli,
            config,
            ..Self::default()
        };
        for (key, value) in std::env::vars() {
            if let Some(bare) = key.strip_prefix(VAR_PREFIX) {
                resolver.process_env.insert(bare.to_string(), value);
            } else if let Some(bare) = key.strip_prefix(SECRET_PREFIX) {
                resolver.secrets.insert(bare.to_string(), value);
            } else {
                resolver.process_env.insert(key, value);
            }
        }
        resolver.builtins.insert(
            "PDK_VERSION".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        if let Ok(pwd) = std::env::current_dir() {
            resolver
                .builtins
                .insert("PWD".to_string(), pwd.display().to_string());
        }
        resolver
    }

    /// A resolver with no environment capture, for tests and embedding.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a CLI-layer override.
    pub fn set_override(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cli.insert(name.into(), value.into());
    }

    /// Add a secret; it resolves like a variable and is reported by
    /// [`VariableResolver::secret_values`] for masker registration.
    pub fn set_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), value.into());
    }

    /// Set a built-in (lowest layer). The orchestrator uses this for
    /// `PDK_WORKSPACE`, `PDK_RUNNER`, `PDK_JOB`, `PDK_STEP`.
    pub fn set_builtin(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.builtins.insert(name.into(), value.into());
    }

    /// Add a config-layer entry (used by tests and the config loader).
    pub fn set_config(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.config.insert(name.into(), value.into());
    }

    /// All secret values that must never reach an output stream.
    pub fn secret_values(&self) -> Vec<String> {
        self.secrets.values().cloned().collect()
    }

    pub fn secret_names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    /// Layered lookup. Timestamps are computed fresh per call.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if let Some(v) = self.cli.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.secrets.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.process_env.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.config.get(name) {
            return Some(v.clone());
        }
        match name {
            "TIMESTAMP" => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            "TIMESTAMP_UNIX" => Some(chrono::Utc::now().timestamp().to_string()),
            _ => self.builtins.get(name).cloned(),
        }
    }

    /// Expand every variable reference in `input`.
    pub fn expand(&self, input: &str) -> Result<Expansion> {
        let mut warnings = Vec::new();
        let mut stack = Vec::new();
        let value = self.expand_inner(input, &mut stack, &mut warnings)?;
        Ok(Expansion { value, warnings })
    }

    /// Expand a whole map of values (environment blocks, `with` inputs).
    pub fn expand_map(&self, map: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            out.insert(k.clone(), self.expand(v)?.value);
        }
        Ok(out)
    }

    fn expand_inner(
        &self,
        input: &str,
        stack: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        if stack.len() > MAX_DEPTH {
            return Err(Error::CircularVariableReference(
                stack.last().cloned().unwrap_or_default(),
            ));
        }

        let bytes = input.as_bytes();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' if bytes.get(i + 1) == Some(&b'$') => {
                    // \${...} and \$NAME are literals; the backslash is consumed.
                    out.push('$');
                    i += 2;
                }
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    let Some(close) = find_matching_brace(&input[i + 2..]) else {
                        // Unterminated brace: leave the rest untouched.
                        out.push_str(&input[i..]);
                        break;
                    };
                    let body = &input[i + 2..i + 2 + close];
                    i += close + 3;
                    out.push_str(&self.expand_braced(body, stack, warnings)?);
                }
                b'$' => {
                    let name_len = ident_len(&input[i + 1..]);
                    if name_len == 0 {
                        out.push('$');
                        i += 1;
                        continue;
                    }
                    let name = &input[i + 1..i + 1 + name_len];
                    i += 1 + name_len;
                    match self.resolve_recursive(name, stack, warnings)? {
                        Some(value) => out.push_str(&value),
                        None => {
                            warnings.push(format!("variable '{name}' is not defined"));
                            out.push('$');
                            out.push_str(name);
                        }
                    }
                }
                _ => {
                    // Copy a full UTF-8 character.
                    match input[i..].chars().next() {
                        Some(ch) => {
                            out.push(ch);
                            i += ch.len_utf8();
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(out)
    }

    fn expand_braced(
        &self,
        body: &str,
        stack: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        // ${NAME}, ${NAME:-default}, ${NAME:?message}; whichever marker
        // appears first wins, so defaults may contain '?' and messages '-'.
        let dash = body.find(":-");
        let question = body.find(":?");
        if let Some(q) = question.filter(|q| dash.is_none_or(|d| *q < d)) {
            let (name, message) = body.split_at(q);
            let message = &message[2..];
            return match self.resolve_recursive(name, stack, warnings)? {
                Some(v) => Ok(v),
                None => Err(Error::MissingRequiredVariable {
                    name: name.to_string(),
                    message: if message.is_empty() {
                        "required but not set".to_string()
                    } else {
                        message.to_string()
                    },
                }),
            };
        }
        if let Some((name, default)) = body.split_once(":-") {
            let resolved = self.resolve_recursive(name, stack, warnings)?;
            return match resolved {
                Some(v) if !v.is_empty() => Ok(v),
                _ => self.expand_inner(default, stack, warnings),
            };
        }
        match self.resolve_recursive(body, stack, warnings)? {
            Some(v) => Ok(v),
            None => {
                warnings.push(format!("variable '{body}' is not defined"));
                Ok(format!("${{{body}}}"))
            }
        }
    }

    /// Resolve a name and expand any references inside its value, with
    /// cycle detection over the current resolution stack.
    fn resolve_recursive(
        &self,
        name: &str,
        stack: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let Some(raw) = self.resolve(name) else {
            return Ok(None);
        };
        if !raw.contains('$') {
            return Ok(Some(raw));
        }
        if stack.iter().any(|n| n == name) {
            return Err(Error::CircularVariableReference(name.to_string()));
        }
        stack.push(name.to_string());
        let expanded = self.expand_inner(&raw, stack, warnings);
        stack.pop();
        expanded.map(Some)
    }
}

/// Index of the `}` closing the reference that starts just before `s`,
/// treating any `${` inside (a default value referencing another
/// variable) as nesting.
fn find_matching_brace(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 1usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
            }
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn ident_len(s: &str) -> usize {
    let mut len = 0;
    for (idx, ch) in s.char_indices() {
        let ok = if idx == 0 {
            ch.is_ascii_alphabetic() || ch == '_'
        } else {
            ch.is_ascii_alphanumeric() || ch == '_'
        };
        if !ok {
            break;
        }
        len = idx + ch.len_utf8();
    }
    len
}
