//! CEL-driven claims processing.
//!
//! Turns verified provider claims into a dashboard identity. Expressions are
//! configuration, validated upstream; this module compiles them once per
//! provider and evaluates them per token verification.

use std::collections::HashMap;

use cel_interpreter::{Context, Program, Value};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::ClaimsConfig;

/// Identity derived from one verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Details {
    /// Name shown in the dashboard UI.
    pub profile_name: String,
    /// RBAC impersonation username.
    pub username: String,
    /// RBAC impersonation groups, deduplicated and sorted.
    pub groups: Vec<String>,
    /// Raw provider claims, kept for audit logging downstream.
    pub claims: serde_json::Value,
    pub session_start: DateTime<Utc>,
}

impl Details {
    /// Canonical cache key. Groups are sorted at construction, so two tokens
    /// naming the same user and group set in any order collide here.
    pub fn cache_key(&self) -> String {
        let mut key = self.username.clone();
        for group in &self.groups {
            key.push('\n');
            key.push_str(group);
        }
        key
    }
}

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("failed to compile expression {name}: {detail}")]
    Compile { name: String, detail: String },
    #[error("failed to evaluate expression {name}: {detail}")]
    Evaluate { name: String, detail: String },
    #[error("expression {name} must produce a {expected}")]
    WrongType {
        name: String,
        expected: &'static str,
    },
    /// Carries the operator-configured, user-facing message.
    #[error("{message}")]
    ValidationFailed { message: String },
    #[error("impersonation resolved to an empty username and no groups")]
    EmptyImpersonation,
    #[error("impersonation group is empty after trimming")]
    EmptyGroup,
}

struct NamedProgram {
    name: String,
    program: Program,
}

fn compile(name: impl Into<String>, expression: &str) -> Result<NamedProgram, ClaimsError> {
    let name = name.into();
    let program = Program::compile(expression).map_err(|e| ClaimsError::Compile {
        name: name.clone(),
        detail: e.to_string(),
    })?;
    Ok(NamedProgram { name, program })
}

/// Compiled claims pipeline for one provider configuration.
pub struct ClaimsProcessor {
    variables: Vec<NamedProgram>,
    validations: Vec<(NamedProgram, String)>,
    profile_name: NamedProgram,
    username: NamedProgram,
    groups: NamedProgram,
}

impl ClaimsProcessor {
    pub fn new(config: &ClaimsConfig) -> Result<Self, ClaimsError> {
        let variables = config
            .variables
            .iter()
            .map(|v| compile(format!("variables.{}", v.name), &v.expression))
            .collect::<Result<Vec<_>, _>>()?;
        let validations = config
            .validations
            .iter()
            .enumerate()
            .map(|(i, v)| {
                compile(format!("validations[{}]", i), &v.expression)
                    .map(|p| (p, v.message.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClaimsProcessor {
            variables,
            validations,
            profile_name: compile("profileName", &config.profile_name_expression)?,
            username: compile("username", &config.username_expression)?,
            groups: compile("groups", &config.groups_expression)?,
        })
    }

    /// Runs the full pipeline: variables in declaration order, then
    /// validations (first failure aborts with its configured message), then
    /// profile and impersonation extraction, then sanitization.
    pub fn process(
        &self,
        claims: &serde_json::Value,
        session_start: DateTime<Utc>,
    ) -> Result<Details, ClaimsError> {
        let mut variables: HashMap<String, Value> = HashMap::new();

        for var in &self.variables {
            let value = self.eval(var, claims, &variables)?;
            // The configured name, not the diagnostic one.
            let name = var
                .name
                .strip_prefix("variables.")
                .unwrap_or(&var.name)
                .to_string();
            variables.insert(name, value);
        }

        for (program, message) in &self.validations {
            match self.eval(program, claims, &variables)? {
                Value::Bool(true) => {}
                Value::Bool(false) => {
                    return Err(ClaimsError::ValidationFailed {
                        message: message.clone(),
                    })
                }
                _ => {
                    return Err(ClaimsError::WrongType {
                        name: program.name.clone(),
                        expected: "boolean",
                    })
                }
            }
        }

        let profile_name = self.eval_string(&self.profile_name, claims, &variables)?;
        let username = self
            .eval_string(&self.username, claims, &variables)?
            .trim()
            .to_string();
        let groups = self.eval_string_list(&self.groups, claims, &variables)?;

        let mut cleaned = Vec::with_capacity(groups.len());
        for group in groups {
            let trimmed = group.trim();
            if trimmed.is_empty() {
                return Err(ClaimsError::EmptyGroup);
            }
            cleaned.push(trimmed.to_string());
        }
        cleaned.sort_unstable();
        cleaned.dedup();

        if username.is_empty() && cleaned.is_empty() {
            return Err(ClaimsError::EmptyImpersonation);
        }

        Ok(Details {
            profile_name,
            username,
            groups: cleaned,
            claims: claims.clone(),
            session_start,
        })
    }

    fn eval(
        &self,
        program: &NamedProgram,
        claims: &serde_json::Value,
        variables: &HashMap<String, Value>,
    ) -> Result<Value, ClaimsError> {
        let mut context = Context::default();
        context
            .add_variable("claims", claims)
            .map_err(|e| ClaimsError::Evaluate {
                name: program.name.clone(),
                detail: e.to_string(),
            })?;
        context.add_variable_from_value("variables", Value::from(variables.clone()));
        program
            .program
            .execute(&context)
            .map_err(|e| ClaimsError::Evaluate {
                name: program.name.clone(),
                detail: e.to_string(),
            })
    }

    fn eval_string(
        &self,
        program: &NamedProgram,
        claims: &serde_json::Value,
        variables: &HashMap<String, Value>,
    ) -> Result<String, ClaimsError> {
        match self.eval(program, claims, variables)? {
            Value::String(s) => Ok(s.as_ref().clone()),
            _ => Err(ClaimsError::WrongType {
                name: program.name.clone(),
                expected: "string",
            }),
        }
    }

    fn eval_string_list(
        &self,
        program: &NamedProgram,
        claims: &serde_json::Value,
        variables: &HashMap<String, Value>,
    ) -> Result<Vec<String>, ClaimsError> {
        match self.eval(program, claims, variables)? {
            Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.as_ref().clone()),
                    _ => Err(ClaimsError::WrongType {
                        name: program.name.clone(),
                        expected: "list of strings",
                    }),
                })
                .collect(),
            _ => Err(ClaimsError::WrongType {
                name: program.name.clone(),
                expected: "list of strings",
            }),
        }
    }
}
