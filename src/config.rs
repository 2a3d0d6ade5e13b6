use regex::Regex;
use std::{collections::HashMap, sync::LazyLock};
use strum::Display;

use crate::{
    engine::{
        scope::{LocalScope, Scope},
        units::Units,
        value::EngineValue,
    },
    error::{ConfigError, VeldResult},
};

/// Read-only job configuration: name → value, loaded from `.jshc` text in
/// `name = number units` format with `#` comments.
#[derive(Debug, Default)]
pub struct Config {
    values: HashMap<String, EngineValue>,
}

impl Config {
    pub fn get(&self, name: &str) -> VeldResult<&EngineValue> {
        self.values
            .get(name)
            .ok_or_else(|| ConfigError::UnknownVariable(name.to_string()).into())
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.values.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlays every config value as an immutable constant on `parent`, so
    /// compiled expressions read job settings the same way they read
    /// attributes.
    pub fn scope<'a>(&self, parent: &'a dyn Scope) -> VeldResult<LocalScope<'a>> {
        let mut scope = LocalScope::new(parent);
        for (name, value) in &self.values {
            scope.define(name, value.clone())?;
        }
        Ok(scope)
    }
}

/// Parser states of the character automaton. Terminal handling at EOF
/// accepts `InValue` and rejects a dangling name or equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum ParseState {
    Idle,
    InComment,
    InVariableName,
    InEqualsSection,
    InValue,
}

static VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-]?\d+(\.\d+)?)\s*(.*)$").expect("value regex"));

/// Parses `.jshc` text. Errors carry line and column (1-based).
pub fn parse_config(text: &str) -> VeldResult<Config> {
    let mut values = HashMap::new();
    let mut state = ParseState::Idle;
    let mut name = String::new();
    let mut value = String::new();
    let mut line: u32 = 1;
    let mut column: u32 = 0;
    let mut value_start = (1, 1);

    let malformed = |line: u32, column: u32, message: &str| -> crate::error::VeldError {
        ConfigError::Malformed {
            line,
            column,
            message: message.to_string(),
        }
        .into()
    };

    for ch in text.chars() {
        if ch == '\n' {
            match state {
                ParseState::InValue => {
                    finish_assignment(&mut values, &name, &value, value_start)?;
                    name.clear();
                    value.clear();
                }
                ParseState::InVariableName | ParseState::InEqualsSection => {
                    return Err(malformed(line, column, "assignment cut short by newline"));
                }
                ParseState::Idle | ParseState::InComment => {}
            }
            state = ParseState::Idle;
            line += 1;
            column = 0;
            continue;
        }
        column += 1;

        state = match state {
            ParseState::Idle => match ch {
                '#' => ParseState::InComment,
                c if c.is_whitespace() => ParseState::Idle,
                c if c.is_ascii_alphabetic() => {
                    name.push(c);
                    ParseState::InVariableName
                }
                _ => return Err(malformed(line, column, "expected a variable name or comment")),
            },
            ParseState::InComment => ParseState::InComment,
            ParseState::InVariableName => match ch {
                c if c.is_ascii_alphanumeric() => {
                    name.push(c);
                    ParseState::InVariableName
                }
                c if c.is_whitespace() => ParseState::InEqualsSection,
                '=' => {
                    value_start = (line, column + 1);
                    ParseState::InValue
                }
                _ => return Err(malformed(line, column, "invalid character in variable name")),
            },
            ParseState::InEqualsSection => match ch {
                '=' => {
                    value_start = (line, column + 1);
                    ParseState::InValue
                }
                c if c.is_whitespace() => ParseState::InEqualsSection,
                _ => return Err(malformed(line, column, "expected '='")),
            },
            ParseState::InValue => match ch {
                '#' => {
                    finish_assignment(&mut values, &name, &value, value_start)?;
                    name.clear();
                    value.clear();
                    ParseState::InComment
                }
                c => {
                    value.push(c);
                    ParseState::InValue
                }
            },
        };
    }

    // Terminal-by-EOF handling.
    match state {
        ParseState::InValue => finish_assignment(&mut values, &name, &value, value_start)?,
        ParseState::InVariableName | ParseState::InEqualsSection => {
            return Err(malformed(line, column, "unexpected end of input"));
        }
        ParseState::Idle | ParseState::InComment => {}
    }

    Ok(Config { values })
}

fn finish_assignment(
    values: &mut HashMap<String, EngineValue>,
    name: &str,
    raw_value: &str,
    at: (u32, u32),
) -> VeldResult<()> {
    let (line, column) = at;
    let trimmed = raw_value.trim();
    let captures = VALUE_RE.captures(trimmed).ok_or_else(|| ConfigError::Malformed {
        line,
        column,
        message: format!("expected 'number units', found '{trimmed}'"),
    })?;

    let number = &captures[1];
    let unit_text = captures.get(3).map(|m| m.as_str().trim()).unwrap_or("");
    let units = Units::of(unit_text).map_err(|e| ConfigError::Malformed {
        line,
        column,
        message: e.to_string(),
    })?;

    let value = if captures.get(2).is_some() {
        EngineValue::decimal(
            number.parse().map_err(|_| ConfigError::Malformed {
                line,
                column,
                message: format!("not a number: '{number}'"),
            })?,
            units,
        )
    } else {
        EngineValue::int(
            number.parse().map_err(|_| ConfigError::Malformed {
                line,
                column,
                message: format!("not an integer: '{number}'"),
            })?,
            units,
        )
    };

    values.insert(name.to_string(), value);
    Ok(())
}
