//! Build parameters and their resolution.
//!
//! Two generations of parameters coexist. Legacy [`ParameterValue`]s are
//! mutable singletons scoped to a workspace and keyed by name. Rich
//! [`WorkspaceBuildParameter`]s are immutable and belong to exactly one build;
//! every new build gets a fresh, fully resolved set derived from the template
//! version's schema.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    Template,
    ImportJob,
    Workspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParameterSourceScheme {
    None,
    #[default]
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParameterDestinationScheme {
    None,
    EnvironmentVariable,
    #[default]
    ProvisionerVariable,
}

/// A legacy scoped parameter value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterValue {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scope: ParameterScope,
    pub scope_id: Uuid,
    pub name: String,
    pub source_scheme: ParameterSourceScheme,
    pub source_value: String,
    pub destination_scheme: ParameterDestinationScheme,
}

/// A caller-supplied legacy parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParameterRequest {
    pub name: String,
    pub source_value: String,
    #[serde(default)]
    pub source_scheme: ParameterSourceScheme,
    #[serde(default)]
    pub destination_scheme: ParameterDestinationScheme,
}

#[derive(Debug, Clone)]
pub struct InsertParameterValueParams {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub scope: ParameterScope,
    pub scope_id: Uuid,
    pub name: String,
    pub source_scheme: ParameterSourceScheme,
    pub source_value: String,
    pub destination_scheme: ParameterDestinationScheme,
}

/// A resolved rich parameter bound to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBuildParameter {
    pub workspace_build_id: Uuid,
    pub name: String,
    pub value: String,
}

/// A caller-supplied rich parameter override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParameter {
    pub name: String,
    pub value: String,
}

impl BuildParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ParameterType {
    #[sqlx(rename = "string")]
    #[serde(rename = "string")]
    String,
    #[sqlx(rename = "number")]
    #[serde(rename = "number")]
    Number,
    #[sqlx(rename = "bool")]
    #[serde(rename = "bool")]
    Bool,
    #[sqlx(rename = "list(string)")]
    #[serde(rename = "list(string)")]
    ListString,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Bool => "bool",
            ParameterType::ListString => "list(string)",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValidationMonotonic {
    Increasing,
    Decreasing,
}

impl fmt::Display for ValidationMonotonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMonotonic::Increasing => f.write_str("increasing"),
            ValidationMonotonic::Decreasing => f.write_str("decreasing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub value: String,
    #[serde(default)]
    pub icon: String,
}

/// One entry of a template version's declared parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersionParameter {
    pub template_version_id: Uuid,
    pub name: String,
    pub description: String,
    pub parameter_type: ParameterType,
    pub mutable: bool,
    pub default_value: String,
    pub icon: String,
    pub options: Vec<ParameterOption>,
    pub validation_regex: String,
    pub validation_min: Option<i32>,
    pub validation_max: Option<i32>,
    pub validation_error: String,
    pub validation_monotonic: Option<ValidationMonotonic>,
    pub required: bool,
    /// Name of the legacy parameter this one replaces, if any.
    pub legacy_variable_name: String,
    pub display_order: i32,
}

impl TemplateVersionParameter {
    /// A mutable, optional string parameter with no validation.
    pub fn new(template_version_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            template_version_id,
            name: name.into(),
            description: String::new(),
            parameter_type: ParameterType::String,
            mutable: true,
            default_value: String::new(),
            icon: String::new(),
            options: Vec::new(),
            validation_regex: String::new(),
            validation_min: None,
            validation_max: None,
            validation_error: String::new(),
            validation_monotonic: None,
            required: false,
            legacy_variable_name: String::new(),
            display_order: 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Parameter {0:?} is required but not provided")]
    Required(String),

    #[error("Parameter {0:?} is not mutable, so it can't be updated after creating a workspace")]
    Immutable(String),

    #[error("Parameter {name:?}: value {value:?} is not one of the allowed options")]
    InvalidOption { name: String, value: String },

    #[error("Parameter {name:?}: {value:?} is not a valid {expected}")]
    InvalidType {
        name: String,
        value: String,
        expected: ParameterType,
    },

    #[error("Parameter {name:?}: {message}")]
    Validation { name: String, message: String },

    #[error("Parameter {name:?}: value must be {direction} (previous value {previous:?})")]
    Monotonic {
        name: String,
        direction: ValidationMonotonic,
        previous: String,
    },

    #[error("Parameter {name:?}: invalid validation regex: {message}")]
    InvalidRegex { name: String, message: String },
}

/// Resolves the final value of one schema entry for a new build.
pub trait ParameterResolver: Send + Sync {
    fn resolve(
        &self,
        parameter: &TemplateVersionParameter,
        prior_rich: &[WorkspaceBuildParameter],
        prior_legacy: &[ParameterValue],
        requested: Option<&BuildParameter>,
    ) -> Result<String, ParameterError>;
}

/// Precedence is override, then the prior value, then the schema default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultParameterResolver;

impl DefaultParameterResolver {
    fn find_last_value(
        parameter: &TemplateVersionParameter,
        prior_rich: &[WorkspaceBuildParameter],
        prior_legacy: &[ParameterValue],
    ) -> Option<String> {
        if let Some(rich) = prior_rich.iter().find(|p| p.name == parameter.name) {
            return Some(rich.value.clone());
        }
        if parameter.legacy_variable_name.is_empty() {
            return None;
        }
        prior_legacy
            .iter()
            .find(|p| p.name == parameter.legacy_variable_name)
            .map(|p| p.source_value.clone())
    }
}

impl ParameterResolver for DefaultParameterResolver {
    fn resolve(
        &self,
        parameter: &TemplateVersionParameter,
        prior_rich: &[WorkspaceBuildParameter],
        prior_legacy: &[ParameterValue],
        requested: Option<&BuildParameter>,
    ) -> Result<String, ParameterError> {
        let previous = Self::find_last_value(parameter, prior_rich, prior_legacy);

        if let (false, Some(requested), Some(previous)) =
            (parameter.mutable, requested, previous.as_ref())
        {
            if &requested.value != previous {
                return Err(ParameterError::Immutable(parameter.name.clone()));
            }
        }

        if parameter.required && requested.is_none() && previous.is_none() {
            return Err(ParameterError::Required(parameter.name.clone()));
        }

        let value = requested
            .map(|r| r.value.clone())
            .or_else(|| previous.clone())
            .unwrap_or_else(|| parameter.default_value.clone());

        validate_parameter_value(parameter, &value, previous.as_deref())?;
        Ok(value)
    }
}

/// Checks a resolved value against the schema entry's type and validation rules.
pub fn validate_parameter_value(
    parameter: &TemplateVersionParameter,
    value: &str,
    previous: Option<&str>,
) -> Result<(), ParameterError> {
    let name = &parameter.name;

    if value.is_empty() {
        if parameter.required {
            return Err(ParameterError::Required(name.clone()));
        }
        return Ok(());
    }

    if !parameter.options.is_empty() {
        let allowed = |candidate: &str| parameter.options.iter().any(|o| o.value == candidate);
        let ok = match parameter.parameter_type {
            ParameterType::ListString => parse_list(parameter, value)?
                .iter()
                .all(|item| allowed(item.as_str())),
            _ => allowed(value),
        };
        if !ok {
            return Err(ParameterError::InvalidOption {
                name: name.clone(),
                value: value.to_string(),
            });
        }
    }

    match parameter.parameter_type {
        ParameterType::String => validate_regex(parameter, value),
        ParameterType::Bool => match value {
            "true" | "false" => Ok(()),
            _ => Err(invalid_type(parameter, value)),
        },
        ParameterType::ListString => parse_list(parameter, value).map(|_| ()),
        ParameterType::Number => {
            let number: i64 = value
                .trim()
                .parse()
                .map_err(|_| invalid_type(parameter, value))?;
            validate_range(parameter, number)?;
            validate_monotonic(parameter, number, previous)
        }
    }
}

fn invalid_type(parameter: &TemplateVersionParameter, value: &str) -> ParameterError {
    ParameterError::InvalidType {
        name: parameter.name.clone(),
        value: value.to_string(),
        expected: parameter.parameter_type,
    }
}

fn parse_list(
    parameter: &TemplateVersionParameter,
    value: &str,
) -> Result<Vec<String>, ParameterError> {
    serde_json::from_str::<Vec<String>>(value).map_err(|_| invalid_type(parameter, value))
}

fn validation_message(parameter: &TemplateVersionParameter, fallback: String) -> String {
    if parameter.validation_error.is_empty() {
        fallback
    } else {
        parameter.validation_error.clone()
    }
}

fn validate_regex(parameter: &TemplateVersionParameter, value: &str) -> Result<(), ParameterError> {
    if parameter.validation_regex.is_empty() {
        return Ok(());
    }
    let regex = Regex::new(&parameter.validation_regex).map_err(|e| {
        ParameterError::InvalidRegex {
            name: parameter.name.clone(),
            message: e.to_string(),
        }
    })?;
    if regex.is_match(value) {
        return Ok(());
    }
    Err(ParameterError::Validation {
        name: parameter.name.clone(),
        message: validation_message(
            parameter,
            format!(
                "value {:?} does not match {:?}",
                value, parameter.validation_regex
            ),
        ),
    })
}

fn validate_range(parameter: &TemplateVersionParameter, number: i64) -> Result<(), ParameterError> {
    let below = parameter.validation_min.is_some_and(|min| number < i64::from(min));
    let above = parameter.validation_max.is_some_and(|max| number > i64::from(max));
    if !below && !above {
        return Ok(());
    }
    let bounds = match (parameter.validation_min, parameter.validation_max) {
        (Some(min), Some(max)) => format!("between {} and {}", min, max),
        (Some(min), None) => format!("at least {}", min),
        (None, Some(max)) => format!("at most {}", max),
        (None, None) => String::new(),
    };
    Err(ParameterError::Validation {
        name: parameter.name.clone(),
        message: validation_message(parameter, format!("value {} must be {}", number, bounds)),
    })
}

fn validate_monotonic(
    parameter: &TemplateVersionParameter,
    number: i64,
    previous: Option<&str>,
) -> Result<(), ParameterError> {
    let (Some(direction), Some(previous)) = (parameter.validation_monotonic, previous) else {
        return Ok(());
    };
    // A previous value that no longer parses can't constrain the new one.
    let Ok(prev) = previous.trim().parse::<i64>() else {
        return Ok(());
    };
    let ok = match direction {
        ValidationMonotonic::Increasing => number >= prev,
        ValidationMonotonic::Decreasing => number <= prev,
    };
    if ok {
        return Ok(());
    }
    Err(ParameterError::Monotonic {
        name: parameter.name.clone(),
        direction,
        previous: previous.to_string(),
    })
}
