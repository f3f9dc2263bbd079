//! Textual interpolation of plugin configuration into route URLs, query parameters and headers.
//!
//! Templates are plain strings with `{{ ... }}` actions. An action is a dotted field path rooted
//! at one of the two data roots:
//!
//! - `.JsonData.<key>[.<key>...]` addresses the non-secret configuration, nested objects included
//! - `.SecureJsonData.<key>` addresses a single decrypted secret
//!
//! A path may be piped into `orEmpty` (`{{.JsonData.region | orEmpty}}`, or the prefix form
//! `{{orEmpty .JsonData.region}}`) to render an absent value as the empty string. Without it a
//! path that resolves to nothing is an error. There are no other functions, no conditionals and
//! no loops.
//!
//! Errors only ever name the path that failed, never a configuration value.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const OR_EMPTY: &str = "orEmpty";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed action starting at byte {0}")]
    Unclosed(usize),
    #[error("malformed action at byte {0}")]
    MalformedAction(usize),
    #[error("unknown data root `{0}`")]
    UnknownRoot(String),
    #[error("no value for `{0}`")]
    MissingValue(String),
    #[error("value at `{0}` is not a string, number or boolean")]
    NotScalar(String),
}

/// Top level names a template may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    JsonData,
    SecureJsonData,
}

impl Root {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "JsonData" => Some(Root::JsonData),
            "SecureJsonData" => Some(Root::SecureJsonData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldPath {
    root: Root,
    keys: Vec<String>,
    or_empty: bool,
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = match self.root {
            Root::JsonData => "JsonData",
            Root::SecureJsonData => "SecureJsonData",
        };
        write!(f, ".{root}")?;
        for key in &self.keys {
            write!(f, ".{key}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Field(FieldPath),
}

/// A parsed template. Parsing is separate from rendering so configuration can be checked once at
/// start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

/// Request-scoped interpolation context built from one plugin's resolved settings.
pub struct TemplateData<'a> {
    json_data: &'a Map<String, Value>,
    secure_json_data: &'a HashMap<String, SecretString>,
}

impl<'a> TemplateData<'a> {
    pub fn new(
        json_data: &'a Map<String, Value>,
        secure_json_data: &'a HashMap<String, SecretString>,
    ) -> Self {
        Self {
            json_data,
            secure_json_data,
        }
    }
}

impl fmt::Debug for TemplateData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateData")
            .field("json_data", &self.json_data)
            .field(
                "secure_json_data",
                &self.secure_json_data.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut pieces = Vec::new();
        let mut offset = 0;
        let mut rest = source;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                pieces.push(Piece::Text(rest[..start].to_string()));
            }
            let action_start = offset + start;
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or(TemplateError::Unclosed(action_start))?;

            pieces.push(Piece::Field(parse_action(&after_open[..end], action_start)?));

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            pieces.push(Piece::Text(rest.to_string()));
        }

        Ok(Template { pieces })
    }

    /// Returns true when the template contains at least one action.
    pub fn has_actions(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::Field(_)))
    }

    pub fn render(&self, data: &TemplateData<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Field(field) => match lookup(field, data)? {
                    Some(value) => out.push_str(&value),
                    None if field.or_empty => {}
                    None => return Err(TemplateError::MissingValue(field.to_string())),
                },
            }
        }
        Ok(out)
    }
}

/// Parses and renders `source` in one go.
pub fn interpolate(source: &str, data: &TemplateData<'_>) -> Result<String, TemplateError> {
    Template::parse(source)?.render(data)
}

fn parse_action(action: &str, at: usize) -> Result<FieldPath, TemplateError> {
    let tokens: Vec<&str> = action.split_whitespace().collect();

    let (path, or_empty) = match tokens.as_slice() {
        [path] => (*path, false),
        [path, "|", func] if *func == OR_EMPTY => (*path, true),
        [func, path] if *func == OR_EMPTY => (*path, true),
        _ => return Err(TemplateError::MalformedAction(at)),
    };

    let path = path
        .strip_prefix('.')
        .ok_or(TemplateError::MalformedAction(at))?;
    let mut segments = path.split('.');
    let root_name = segments.next().unwrap_or_default();
    let root =
        Root::parse(root_name).ok_or_else(|| TemplateError::UnknownRoot(root_name.to_string()))?;

    let keys: Vec<String> = segments.map(str::to_string).collect();
    if keys.iter().any(|k| !is_identifier(k)) {
        return Err(TemplateError::MalformedAction(at));
    }

    Ok(FieldPath {
        root,
        keys,
        or_empty,
    })
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lookup(field: &FieldPath, data: &TemplateData<'_>) -> Result<Option<String>, TemplateError> {
    match field.root {
        Root::SecureJsonData => match field.keys.as_slice() {
            [key] => Ok(data
                .secure_json_data
                .get(key)
                .map(|secret| secret.expose_secret().to_string())),
            [] => Err(TemplateError::NotScalar(field.to_string())),
            // secrets are flat strings, there is nothing to descend into
            _ => Ok(None),
        },
        Root::JsonData => {
            let Some((first, rest)) = field.keys.split_first() else {
                return Err(TemplateError::NotScalar(field.to_string()));
            };

            let mut current = data.json_data.get(first);
            for key in rest {
                current = match current {
                    Some(Value::Object(map)) => map.get(key),
                    Some(Value::Null) | None => None,
                    Some(_) => return Err(TemplateError::NotScalar(field.to_string())),
                };
            }

            match current {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(Value::Number(n)) => Ok(Some(n.to_string())),
                Some(Value::Bool(b)) => Ok(Some(b.to_string())),
                Some(Value::Array(_) | Value::Object(_)) => {
                    Err(TemplateError::NotScalar(field.to_string()))
                }
            }
        }
    }
}
