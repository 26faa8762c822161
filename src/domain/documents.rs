//! Document payload carried by a job: what to render and how.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_TITLE: &str = "Documento";
const DEFAULT_MARGIN: &str = "2cm";
const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "blank")]
    Blank,
    #[serde(rename = "logo")]
    Logo,
    #[serde(rename = "watermark")]
    Watermark,
    #[serde(rename = "exam")]
    Exam,
    #[serde(rename = "assessment")]
    Assessment,
    #[serde(rename = "quiz")]
    Quiz,
    #[serde(rename = "budget")]
    Budget,
    #[serde(rename = "budget-premium")]
    BudgetPremium,
    #[serde(rename = "report")]
    Report,
    #[serde(rename = "invoice")]
    Invoice,
    #[serde(rename = "anamnesis")]
    Anamnesis,
    #[serde(rename = "prescription")]
    Prescription,
    #[serde(rename = "clinical_form")]
    ClinicalForm,
}

impl DocumentType {
    pub const ALL: [DocumentType; 13] = [
        Self::Blank,
        Self::Logo,
        Self::Watermark,
        Self::Exam,
        Self::Assessment,
        Self::Quiz,
        Self::Budget,
        Self::BudgetPremium,
        Self::Report,
        Self::Invoice,
        Self::Anamnesis,
        Self::Prescription,
        Self::ClinicalForm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::Logo => "logo",
            Self::Watermark => "watermark",
            Self::Exam => "exam",
            Self::Assessment => "assessment",
            Self::Quiz => "quiz",
            Self::Budget => "budget",
            Self::BudgetPremium => "budget-premium",
            Self::Report => "report",
            Self::Invoice => "invoice",
            Self::Anamnesis => "anamnesis",
            Self::Prescription => "prescription",
            Self::ClinicalForm => "clinical_form",
        }
    }

    /// Data paths that must be present for this type.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Budget | Self::BudgetPremium => &["budget.items"],
            _ => &[],
        }
    }
}

impl Display for DocumentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for DocumentType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == value)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "pt-BR")]
    PtBr,
    #[serde(rename = "en-US")]
    EnUs,
    #[serde(rename = "es-ES")]
    EsEs,
}

impl Language {
    pub const ALL: [Language; 3] = [Self::PtBr, Self::EnUs, Self::EsEs];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PtBr => "pt-BR",
            Self::EnUs => "en-US",
            Self::EsEs => "es-ES",
        }
    }
}

impl TryFrom<&str> for Language {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == value)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageFormat {
    #[default]
    A4,
    A5,
    Letter,
    Legal,
}

impl PageFormat {
    pub const ALL: [PageFormat; 4] = [Self::A4, Self::A5, Self::Letter, Self::Legal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A4 => "A4",
            Self::A5 => "A5",
            Self::Letter => "Letter",
            Self::Legal => "Legal",
        }
    }

    /// Paper name understood by the typesetter.
    pub fn paper(self) -> &'static str {
        match self {
            Self::A4 => "a4",
            Self::A5 => "a5",
            Self::Letter => "us-letter",
            Self::Legal => "us-legal",
        }
    }
}

impl TryFrom<&str> for PageFormat {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == value)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl TryFrom<&str> for Orientation {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "portrait" => Ok(Self::Portrait),
            "landscape" => Ok(Self::Landscape),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub top: String,
    pub right: String,
    pub bottom: String,
    pub left: String,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: DEFAULT_MARGIN.to_string(),
            right: DEFAULT_MARGIN.to_string(),
            bottom: DEFAULT_MARGIN.to_string(),
            left: DEFAULT_MARGIN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderOptions {
    pub format: PageFormat,
    pub orientation: Orientation,
    pub margins: Margins,
}

/// A validated generation request, as carried on the generate queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub document_type: DocumentType,
    pub title: String,
    pub language: Language,
    pub data: Map<String, Value>,
    pub options: RenderOptions,
}

/// Unvalidated submission fields.
#[derive(Debug, Clone, Default)]
pub struct DocumentDraft {
    pub document_type: Option<String>,
    pub title: Option<String>,
    pub language: Option<String>,
    pub data: Option<Value>,
    pub format: Option<String>,
    pub orientation: Option<String>,
    pub margin_top: Option<String>,
    pub margin_right: Option<String>,
    pub margin_bottom: Option<String>,
    pub margin_left: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid document request: {}", .problems.join("; "))]
pub struct InvalidDocument {
    pub problems: Vec<String>,
}

impl DocumentDraft {
    /// Validate every field, collecting all problems rather than stopping
    /// at the first.
    pub fn validate(self) -> Result<DocumentRequest, InvalidDocument> {
        let mut problems = Vec::new();

        let document_type = match self.document_type.as_deref().map(str::trim) {
            None | Some("") => {
                problems.push("`type` is required".to_string());
                None
            }
            Some(raw) => match DocumentType::try_from(raw) {
                Ok(kind) => Some(kind),
                Err(()) => {
                    problems.push(format!("unsupported document type `{raw}`"));
                    None
                }
            },
        };

        let title = match self.title.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_TITLE.to_string(),
            Some(title) if title.chars().count() > MAX_TITLE_LEN => {
                problems.push(format!("`title` exceeds {MAX_TITLE_LEN} characters"));
                String::new()
            }
            Some(title) => title.to_string(),
        };

        let language = match self.language.as_deref() {
            None => Language::default(),
            Some(raw) => Language::try_from(raw).unwrap_or_else(|()| {
                problems.push(format!("unsupported language `{raw}`"));
                Language::default()
            }),
        };

        let data = match self.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                problems.push("`data` must be a JSON object".to_string());
                Map::new()
            }
        };

        if let Some(kind) = document_type {
            for path in kind.required_fields() {
                if !lookup_array(&data, path) {
                    problems.push(format!("`data.{path}` must be an array for `{kind}`"));
                }
            }
        }

        let format = match self.format.as_deref() {
            None => PageFormat::default(),
            Some(raw) => PageFormat::try_from(raw).unwrap_or_else(|()| {
                problems.push(format!("unsupported page format `{raw}`"));
                PageFormat::default()
            }),
        };

        let orientation = match self.orientation.as_deref() {
            None => Orientation::default(),
            Some(raw) => Orientation::try_from(raw).unwrap_or_else(|()| {
                problems.push(format!("unsupported orientation `{raw}`"));
                Orientation::default()
            }),
        };

        let mut margins = Margins::default();
        for (side, value, slot) in [
            ("top", self.margin_top, &mut margins.top),
            ("right", self.margin_right, &mut margins.right),
            ("bottom", self.margin_bottom, &mut margins.bottom),
            ("left", self.margin_left, &mut margins.left),
        ] {
            let Some(value) = value else { continue };
            if is_length(&value) {
                *slot = value;
            } else {
                problems.push(format!(
                    "margin `{side}` must look like `2cm`, `20mm`, `1in` or `12pt`, got `{value}`"
                ));
            }
        }

        match document_type {
            Some(document_type) if problems.is_empty() => Ok(DocumentRequest {
                document_type,
                title,
                language,
                data,
                options: RenderOptions {
                    format,
                    orientation,
                    margins,
                },
            }),
            _ => Err(InvalidDocument { problems }),
        }
    }
}

fn lookup_array(data: &Map<String, Value>, path: &str) -> bool {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return false;
    };
    let mut current = data.get(first);
    for segment in segments {
        current = current.and_then(|value| value.get(segment));
    }
    matches!(current, Some(Value::Array(_)))
}

fn is_length(value: &str) -> bool {
    let Some(unit_start) = value.find(|c: char| c.is_ascii_alphabetic()) else {
        return false;
    };
    let (number, unit) = value.split_at(unit_start);
    if !matches!(unit, "cm" | "mm" | "in" | "pt") {
        return false;
    }
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(whole) && fraction.is_none_or(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(kind: &str) -> DocumentDraft {
        DocumentDraft {
            document_type: Some(kind.to_string()),
            ..DocumentDraft::default()
        }
    }

    #[test]
    fn defaults_are_applied() {
        let request = draft("report").validate().expect("valid");
        assert_eq!(request.title, DEFAULT_TITLE);
        assert_eq!(request.language, Language::PtBr);
        assert_eq!(request.options, RenderOptions::default());
        assert!(request.data.is_empty());
    }

    #[test]
    fn all_problems_are_reported_together() {
        let err = DocumentDraft {
            document_type: Some("poster".into()),
            language: Some("fr-FR".into()),
            data: Some(json!([1, 2])),
            format: Some("A0".into()),
            orientation: Some("diagonal".into()),
            margin_left: Some("2 cm".into()),
            ..DocumentDraft::default()
        }
        .validate()
        .expect_err("invalid");

        assert_eq!(err.problems.len(), 6, "{:?}", err.problems);
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = DocumentDraft::default().validate().expect_err("invalid");
        assert_eq!(err.problems, vec!["`type` is required".to_string()]);
    }

    #[test]
    fn budget_requires_items_array() {
        let mut budget = draft("budget-premium");
        budget.data = Some(json!({"budget": {"items": "none"}}));
        assert!(budget.validate().is_err());

        let mut budget = draft("budget");
        budget.data = Some(json!({"budget": {"items": [{"name": "x", "price": 1}]}}));
        assert!(budget.validate().is_ok());
    }

    #[test]
    fn margin_lengths() {
        assert!(is_length("2cm"));
        assert!(is_length("0.5in"));
        assert!(is_length("12pt"));
        assert!(!is_length("cm"));
        assert!(!is_length("2.cm"));
        assert!(!is_length("15px"));
        assert!(!is_length("-2mm"));
    }

    #[test]
    fn payload_serializes_with_wire_names() {
        let request = draft("clinical_form").validate().expect("valid");
        let value = serde_json::to_value(&request).expect("serializes");
        assert_eq!(value["document_type"], "clinical_form");
        assert_eq!(value["language"], "pt-BR");
        assert_eq!(value["options"]["orientation"], "portrait");
    }
}
