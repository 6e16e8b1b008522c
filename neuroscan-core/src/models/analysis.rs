//! Structured MRI analysis as returned by the vision model.
//!
//! The model reply is untrusted input: [`Analysis::from_model_reply`] is the
//! single parse-or-fail boundary between raw text and typed findings.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TumorType {
    Glioma,
    Meningioma,
    Pituitary,
    #[default]
    None,
}

impl TumorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TumorType::Glioma => "glioma",
            TumorType::Meningioma => "meningioma",
            TumorType::Pituitary => "pituitary",
            TumorType::None => "none",
        }
    }
}

impl fmt::Display for TumorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TumorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "glioma" => Ok(TumorType::Glioma),
            "meningioma" => Ok(TumorType::Meningioma),
            "pituitary" | "pituitary tumor" | "pituitary adenoma" => Ok(TumorType::Pituitary),
            "none" | "" | "n/a" | "no tumor" => Ok(TumorType::None),
            other => Err(format!("unknown tumor type '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for TumorType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => raw.parse().map_err(serde::de::Error::custom),
            None => Ok(TumorType::None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Mild,
    Moderate,
    Severe,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" | "n/a" => Ok(Severity::None),
            "mild" => Ok(Severity::Mild),
            "moderate" => Ok(Severity::Moderate),
            "severe" => Ok(Severity::Severe),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => raw.parse().map_err(serde::de::Error::custom),
            None => Ok(Severity::None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TumorDetection {
    pub present: bool,
    #[serde(rename = "type", alias = "tumor_type", alias = "tumorType", default)]
    pub tumor_type: TumorType,
    #[serde(alias = "confidencePercentage", alias = "confidence", default)]
    pub confidence_percentage: f64,
    #[serde(default, deserialize_with = "text_or_list")]
    pub location: String,
    #[serde(
        alias = "sizeDescription",
        alias = "size",
        default,
        deserialize_with = "text_or_list"
    )]
    pub size_description: String,
    #[serde(
        default,
        deserialize_with = "optional_coordinates",
        skip_serializing_if = "Option::is_none"
    )]
    pub coordinates: Option<Coordinates>,
    #[serde(alias = "keyFeatures", default, skip_serializing_if = "Option::is_none")]
    pub key_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinguishers: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrayMatter {
    #[serde(default)]
    pub abnormalities: bool,
    #[serde(alias = "regionsAffected", default, deserialize_with = "text_or_list")]
    pub regions_affected: String,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialDiagnosis {
    #[serde(rename = "type", alias = "tumor_type", alias = "tumorType")]
    pub tumor_type: TumorType,
    #[serde(alias = "confidencePercentage", alias = "confidence", default)]
    pub confidence_percentage: f64,
    #[serde(alias = "keyFeatures", default)]
    pub key_features: Vec<String>,
    #[serde(default)]
    pub distinguishers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(alias = "tumorDetection")]
    pub tumor_detection: TumorDetection,
    #[serde(alias = "grayMatter", alias = "gray_matter_assessment")]
    pub gray_matter: GrayMatter,
    #[serde(
        alias = "otherAbnormalities",
        default,
        deserialize_with = "text_or_list"
    )]
    pub other_abnormalities: String,
    #[serde(
        alias = "differentialDiagnosis",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub differential_diagnosis: Option<Vec<DifferentialDiagnosis>>,
    #[serde(
        alias = "followUpActions",
        alias = "recommended_follow_up",
        default,
        deserialize_with = "text_or_list"
    )]
    pub follow_up_actions: String,
}

/// Why a model reply could not be turned into an [`Analysis`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisShapeError {
    #[error("reply contains no JSON object")]
    NoJson,
    #[error("reply is not valid analysis JSON: {0}")]
    Json(String),
    #[error("reply failed validation: {0}")]
    Invalid(String),
}

impl Analysis {
    /// Parse and validate a raw model reply.
    pub fn from_model_reply(raw: &str) -> Result<Self, AnalysisShapeError> {
        let body = extract_json_object(raw).ok_or(AnalysisShapeError::NoJson)?;
        let mut analysis: Analysis =
            serde_json::from_str(body).map_err(|e| AnalysisShapeError::Json(e.to_string()))?;
        analysis.validate().map_err(AnalysisShapeError::Invalid)?;
        analysis.normalize();
        Ok(analysis)
    }

    pub fn validate(&self) -> Result<(), String> {
        check_confidence("tumor_detection", self.tumor_detection.confidence_percentage)?;

        if self.tumor_detection.present && self.tumor_detection.coordinates.is_none() {
            return Err("tumor_detection.coordinates is required when a tumor is present".into());
        }
        if self.tumor_detection.present && self.tumor_detection.tumor_type == TumorType::None {
            return Err("tumor_detection.type must name a tumor when present is true".into());
        }

        for (i, dd) in self.differential_diagnosis.iter().flatten().enumerate() {
            check_confidence(
                &format!("differential_diagnosis[{}]", i),
                dd.confidence_percentage,
            )?;
        }
        Ok(())
    }

    /// Drop fields that contradict `present`/`abnormalities`.
    fn normalize(&mut self) {
        if !self.tumor_detection.present {
            self.tumor_detection.tumor_type = TumorType::None;
            self.tumor_detection.coordinates = None;
        }
        if !self.gray_matter.abnormalities {
            self.gray_matter.severity = Severity::None;
        }
    }

    /// Coordinates of a detected tumor, if any.
    pub fn tumor_coordinates(&self) -> Option<Coordinates> {
        if self.tumor_detection.present {
            self.tumor_detection.coordinates
        } else {
            None
        }
    }
}

fn check_confidence(field: &str, value: f64) -> Result<(), String> {
    if !(0.0..=100.0).contains(&value) {
        return Err(format!(
            "{}.confidence_percentage must be within 0-100, got {}",
            field, value
        ));
    }
    Ok(())
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```(?:json|JSON)?\s*\n?(.*?)\n?\s*```\s*$")
            .expect("fence regex is valid")
    })
}

/// Strip markdown fences and surrounding prose, returning the JSON object text.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let unfenced = fence_regex()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    if unfenced.starts_with('{') && unfenced.ends_with('}') {
        return Some(unfenced);
    }

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (start < end).then(|| &unfenced[start..=end])
}

/// `null`, or an object whose components are all `null`, means "no coordinates".
fn optional_coordinates<'de, D>(deserializer: D) -> Result<Option<Coordinates>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(ref map))
            if ["x", "y", "z"]
                .iter()
                .all(|k| map.get(*k).map_or(true, |v| v.is_null())) =>
        {
            Ok(None)
        }
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn text_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        List(Vec<String>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(s)) => s,
        Some(Raw::List(items)) => items.join("; "),
        None => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glioma_reply() -> String {
        serde_json::json!({
            "tumor_detection": {
                "present": true,
                "type": "glioma",
                "confidence_percentage": 82,
                "location": "left frontal lobe",
                "size_description": "approximately 3 cm",
                "coordinates": { "x": 140, "y": 90, "z": 180 },
                "key_features": ["irregular margins", "surrounding edema"]
            },
            "gray_matter": {
                "abnormalities": false,
                "regions_affected": "none",
                "severity": "none"
            },
            "other_abnormalities": "mild midline shift",
            "follow_up_actions": "Contrast-enhanced MRI and neurosurgical consult"
        })
        .to_string()
    }

    #[test]
    fn test_parses_plain_json_reply() {
        let analysis = Analysis::from_model_reply(&glioma_reply()).unwrap();
        assert!(analysis.tumor_detection.present);
        assert_eq!(analysis.tumor_detection.tumor_type, TumorType::Glioma);
        assert_eq!(
            analysis.tumor_coordinates(),
            Some(Coordinates { x: 140, y: 90, z: 180 })
        );
        assert_eq!(analysis.gray_matter.severity, Severity::None);
    }

    #[test]
    fn test_strips_markdown_fences() {
        let fenced = format!("```json\n{}\n```", glioma_reply());
        let analysis = Analysis::from_model_reply(&fenced).unwrap();
        assert_eq!(analysis.tumor_detection.location, "left frontal lobe");
    }

    #[test]
    fn test_extracts_object_from_surrounding_prose() {
        let chatty = format!("Here is the analysis:\n{}\nLet me know!", glioma_reply());
        assert!(Analysis::from_model_reply(&chatty).is_ok());
    }

    #[test]
    fn test_accepts_camel_case_and_list_fields() {
        let reply = serde_json::json!({
            "tumorDetection": {
                "present": false,
                "type": "None",
                "confidencePercentage": 95.5
            },
            "grayMatter": {
                "abnormalities": true,
                "regionsAffected": ["hippocampus", "temporal cortex"],
                "severity": "Mild"
            },
            "otherAbnormalities": null,
            "followUpActions": ["Routine follow-up", "Cognitive screening"]
        })
        .to_string();

        let analysis = Analysis::from_model_reply(&reply).unwrap();
        assert!(!analysis.tumor_detection.present);
        assert_eq!(analysis.gray_matter.regions_affected, "hippocampus; temporal cortex");
        assert_eq!(analysis.gray_matter.severity, Severity::Mild);
        assert_eq!(analysis.other_abnormalities, "");
        assert_eq!(
            analysis.follow_up_actions,
            "Routine follow-up; Cognitive screening"
        );
    }

    #[test]
    fn test_rejects_non_json_reply() {
        let err = Analysis::from_model_reply("I cannot analyze medical images.").unwrap_err();
        assert_eq!(err, AnalysisShapeError::NoJson);
    }

    #[test]
    fn test_rejects_unknown_tumor_type() {
        let reply = glioma_reply().replace("\"glioma\"", "\"astrocytoma\"");
        assert!(matches!(
            Analysis::from_model_reply(&reply),
            Err(AnalysisShapeError::Json(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let reply = glioma_reply().replace("82", "182");
        assert!(matches!(
            Analysis::from_model_reply(&reply),
            Err(AnalysisShapeError::Invalid(_))
        ));
    }

    #[test]
    fn test_requires_coordinates_when_tumor_present() {
        let mut value: serde_json::Value = serde_json::from_str(&glioma_reply()).unwrap();
        value["tumor_detection"]
            .as_object_mut()
            .unwrap()
            .remove("coordinates");
        let err = Analysis::from_model_reply(&value.to_string()).unwrap_err();
        assert!(matches!(err, AnalysisShapeError::Invalid(_)));
    }

    #[test]
    fn test_present_tumor_must_name_a_type() {
        let reply = glioma_reply().replace("\"glioma\"", "\"none\"");
        let err = Analysis::from_model_reply(&reply).unwrap_err();
        assert_eq!(
            err,
            AnalysisShapeError::Invalid(
                "tumor_detection.type must name a tumor when present is true".into()
            )
        );
    }

    #[test]
    fn test_fractional_coordinates_are_malformed() {
        let reply = glioma_reply().replace("\"x\":140", "\"x\":140.5");
        assert!(Analysis::from_model_reply(&reply).is_err());
    }

    #[test]
    fn test_absent_tumor_drops_coordinates() {
        let reply = serde_json::json!({
            "tumor_detection": {
                "present": false,
                "type": "glioma",
                "coordinates": { "x": 1, "y": 2, "z": 3 }
            },
            "gray_matter": { "abnormalities": false, "severity": "moderate" },
            "follow_up_actions": "none"
        })
        .to_string();
        let analysis = Analysis::from_model_reply(&reply).unwrap();
        assert_eq!(analysis.tumor_detection.tumor_type, TumorType::None);
        assert!(analysis.tumor_coordinates().is_none());
        assert_eq!(analysis.gray_matter.severity, Severity::None);
    }
}
