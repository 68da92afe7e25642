//! Result parsing: turns the model's raw text into an `AnalysisResult`.
//!
//! Two strategies exist and exactly one is active per deployment, selected by
//! `ResultFormat` at configuration time.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CLASSIFICATION: &str = "N/A";
pub const DEFAULT_RECOMMENDATION: &str = "Review manually.";

/// How the model is asked to answer, and therefore how its text is parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// Labeled lines ("Classification: ...") pulled out with regexes.
    Freeform,
    /// JSON constrained by a response schema.
    #[default]
    Structured,
}

#[derive(Debug, Error)]
#[error("unknown result format '{0}'")]
pub struct UnknownResultFormat(String);

impl FromStr for ResultFormat {
    type Err = UnknownResultFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "freeform" => Ok(ResultFormat::Freeform),
            "structured" => Ok(ResultFormat::Structured),
            other => Err(UnknownResultFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "N/A")]
    NotApplicable,
    Mild,
    Moderate,
    Severe,
    #[serde(rename = "Healthy Appearance")]
    HealthyAppearance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub condition: String,
    pub severity: Severity,
    pub confidence: String,
}

/// Schema-constrained report. Field names match the response schema sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReport {
    pub is_retina_image: bool,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeformReport {
    pub classification: String,
    pub description: String,
    pub recommendation: String,
    pub raw_text: String,
}

/// One completed analysis. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum AnalysisResult {
    Freeform(FreeformReport),
    Structured(StructuredReport),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("model returned malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

impl ResultFormat {
    pub fn parse(self, text: &str) -> Result<AnalysisResult, ParseError> {
        match self {
            ResultFormat::Freeform => Ok(AnalysisResult::Freeform(parse_freeform(text))),
            ResultFormat::Structured => parse_structured(text).map(AnalysisResult::Structured),
        }
    }
}

fn label_regexes() -> &'static [Regex; 3] {
    static LABELS: OnceLock<[Regex; 3]> = OnceLock::new();
    LABELS.get_or_init(|| {
        ["Classification", "Description", "Recommendation"].map(|label| {
            Regex::new(&format!(r"(?i){label}:[ \t]*([^\r\n]*)"))
                .expect("label pattern is a valid regex")
        })
    })
}

fn capture_line(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Lossy, order-independent extraction of the three labeled lines.
pub fn parse_freeform(text: &str) -> FreeformReport {
    let [classification, description, recommendation] = label_regexes();
    let raw_text = text.trim().to_string();

    FreeformReport {
        classification: capture_line(classification, text)
            .unwrap_or_else(|| DEFAULT_CLASSIFICATION.to_string()),
        description: capture_line(description, text).unwrap_or_else(|| raw_text.clone()),
        recommendation: capture_line(recommendation, text)
            .unwrap_or_else(|| DEFAULT_RECOMMENDATION.to_string()),
        raw_text,
    }
}

pub fn parse_structured(text: &str) -> Result<StructuredReport, ParseError> {
    Ok(serde_json::from_str(strip_json_fences(text))?)
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(stripped) = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
    else {
        return text;
    };
    stripped
        .trim_start()
        .strip_suffix("```")
        .map(|s| s.trim())
        .unwrap_or(stripped.trim_start())
}
