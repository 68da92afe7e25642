use serde_json::{json, Value};

use crate::analysis::parse::ResultFormat;

pub const ANALYSIS_USER_PROMPT: &str = "Analyze this retinal fundus image and produce a preliminary screening report.";

const SYSTEM_ROLE: &str = "You are an ophthalmology screening assistant reviewing retinal fundus photographs. \
Your output is a preliminary, non-diagnostic observation intended to be reviewed by a qualified eye-care professional. \
Never claim certainty, never prescribe treatment, and say so plainly when the image is not a retinal fundus photograph or is too poor to assess.";

const FREEFORM_SHAPE: &str = "Answer with exactly three lines and nothing else:\n\
Classification: <one short label, e.g. Healthy Retina, Diabetic Retinopathy, Glaucoma Suspect, Not a Retina Image>\n\
Description: <one or two sentences describing what is visible>\n\
Recommendation: <one short follow-up recommendation>";

const STRUCTURED_SHAPE: &str = "Answer with a single JSON object matching the provided response schema. \
Set isRetinaImage to false and leave findings empty when the image is not a retinal fundus photograph. \
Use severity \"Healthy Appearance\" for structures that look normal and \"N/A\" when severity cannot be judged.";

pub fn system_instruction(format: ResultFormat) -> String {
    let shape = match format {
        ResultFormat::Freeform => FREEFORM_SHAPE,
        ResultFormat::Structured => STRUCTURED_SHAPE,
    };
    format!("{SYSTEM_ROLE}\n\n{shape}")
}

/// `responseSchema` for schema-constrained mode. Mirrors `StructuredReport`.
pub fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "isRetinaImage": { "type": "BOOLEAN" },
            "summary": { "type": "STRING" },
            "findings": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "condition": { "type": "STRING" },
                        "severity": {
                            "type": "STRING",
                            "enum": ["N/A", "Mild", "Moderate", "Severe", "Healthy Appearance"]
                        },
                        "confidence": { "type": "STRING" }
                    },
                    "required": ["condition", "severity", "confidence"]
                }
            }
        },
        "required": ["isRetinaImage", "summary", "findings"]
    })
}
