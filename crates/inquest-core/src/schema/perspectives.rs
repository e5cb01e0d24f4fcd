//! Research perspectives and their prompt contracts.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

/// Schema discriminator for `perspectives.json`.
pub const PERSPECTIVES_SCHEMA: &str = "perspectives.v1";

/// How a perspective relates to the main line of inquiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Standard,
    Independent,
    Contrarian,
}

/// Output contract every wave output for this perspective must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContract {
    pub max_words: u32,
    pub max_sources: u32,
    pub tool_budget: u32,
    pub must_include_sections: Vec<String>,
}

/// A named research lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perspective {
    pub id: String,
    pub title: String,
    pub track: Track,
    pub agent_type: String,
    pub prompt_contract: PromptContract,
}

/// `perspectives.json` (schema `perspectives.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectivesDoc {
    pub schema_version: String,
    pub perspectives: Vec<Perspective>,
}

impl PerspectivesDoc {
    pub fn new(perspectives: Vec<Perspective>) -> Self {
        Self {
            schema_version: PERSPECTIVES_SCHEMA.to_string(),
            perspectives,
        }
    }

    pub fn find(&self, id: &str) -> Result<&Perspective> {
        self.perspectives.iter().find(|p| p.id == id).ok_or_else(|| {
            CoreError::new(
                ErrorCode::PerspectiveNotFound,
                format!("perspective {id:?} not found"),
            )
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != PERSPECTIVES_SCHEMA {
            return Err(CoreError::schema(format!(
                "perspectives schema_version {:?}, expected {PERSPECTIVES_SCHEMA:?}",
                self.schema_version
            )));
        }
        if self.perspectives.is_empty() {
            return Err(CoreError::schema("perspectives list must be non-empty"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.perspectives {
            if p.id.trim().is_empty() || p.id.contains('/') || p.id.contains("..") {
                return Err(CoreError::schema(format!(
                    "perspective id {:?} is not a safe file stem",
                    p.id
                )));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(CoreError::new(
                    ErrorCode::DuplicatePerspectiveId,
                    format!("duplicate perspective id {:?}", p.id),
                ));
            }
            if p.prompt_contract.tool_budget == 0 {
                return Err(CoreError::new(
                    ErrorCode::InvalidToolBudget,
                    format!("perspective {:?} has a zero tool budget", p.id),
                ));
            }
            if p.prompt_contract.max_words == 0 || p.prompt_contract.max_sources == 0 {
                return Err(CoreError::schema(format!(
                    "perspective {:?} has zero word or source cap",
                    p.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(id: &str) -> Perspective {
        Perspective {
            id: id.to_string(),
            title: format!("Perspective {id}"),
            track: Track::Standard,
            agent_type: "researcher".into(),
            prompt_contract: PromptContract {
                max_words: 1200,
                max_sources: 10,
                tool_budget: 20,
                must_include_sections: vec!["Findings".into(), "Sources".into()],
            },
        }
    }

    #[test]
    fn test_valid_doc() {
        let doc = PerspectivesDoc::new(vec![sample("p-A"), sample("p-B")]);
        doc.validate().expect("valid");
        assert_eq!(doc.find("p-B").unwrap().id, "p-B");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let doc = PerspectivesDoc::new(vec![sample("p-A"), sample("p-A")]);
        let err = doc.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicatePerspectiveId);
    }

    #[test]
    fn test_zero_tool_budget_rejected() {
        let mut p = sample("p-A");
        p.prompt_contract.tool_budget = 0;
        let err = PerspectivesDoc::new(vec![p]).validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToolBudget);
    }

    #[test]
    fn test_unsafe_id_rejected() {
        let mut p = sample("p-A");
        p.id = "../p".into();
        assert!(PerspectivesDoc::new(vec![p]).validate().is_err());
    }

    #[test]
    fn test_missing_perspective() {
        let doc = PerspectivesDoc::new(vec![sample("p-A")]);
        let err = doc.find("p-Z").unwrap_err();
        assert_eq!(err.code, ErrorCode::PerspectiveNotFound);
    }
}
