//! Machine-readable command output

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(OutputFormat::Raw),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::ConfigInvalid(format!("invalid output format: {other}"))),
        }
    }
}

/// `trigger-check` response: the checked pattern and the flattened workflow
/// expansion it would run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TriggerCheckResult {
    pub pattern: String,
    pub workflows: Vec<String>,
}

impl TriggerCheckResult {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
            OutputFormat::Raw => Ok(format!(
                "pattern: {} -> workflows: [{}]",
                self.pattern,
                self.workflows.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
            OutputFormat::Raw => {
                let mut out = String::new();
                if self.is_valid {
                    out.push_str("config is valid");
                } else {
                    out.push_str("config is invalid");
                }
                if let Some(error) = &self.error {
                    out.push_str(&format!(": {error}"));
                }
                for warning in &self.warnings {
                    out.push_str(&format!("\nwarning: {warning}"));
                }
                Ok(out)
            }
        }
    }
}
