//! Versioned prompt templates.
//!
//! Prompts live as plain-text files under the configured prompt directory,
//! one file per task and version (`doc_type_check_v1.txt`,
//! `extract_fields_v1.txt`). Each template carries exactly one `{}`
//! placeholder, which receives the OCR pages JSON. The placeholder count is
//! validated at load time so a malformed template fails startup, not a run.

use tokio::fs;

use crate::{config::Settings, prelude::*};

/// The substitution marker. Exactly one occurrence per template.
const PLACEHOLDER: &str = "{}";

/// A loaded, validated prompt template.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    name: String,
    text: String,
}

impl PromptTemplate {
    /// Load a template from `dir`, named `<task>_<version>.txt`.
    pub async fn load(dir: &Path, task: &str, version: &str) -> Result<Self> {
        let name = format!("{}_{}", task, version);
        let path = dir.join(format!("{}.txt", name));
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read prompt {:?}", path))?;
        Self::from_text(name, text)
    }

    /// Validate placeholder count and build the template.
    pub fn from_text(name: impl Into<String>, text: String) -> Result<Self> {
        let name = name.into();
        let count = text.matches(PLACEHOLDER).count();
        if count != 1 {
            return Err(anyhow!(
                "prompt {} must contain exactly one {} placeholder, found {}",
                name,
                PLACEHOLDER,
                count
            ));
        }
        Ok(Self { name, text })
    }

    /// Substitute the payload into the placeholder.
    pub fn render(&self, payload: &str) -> String {
        self.text.replacen(PLACEHOLDER, payload, 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The two prompts the pipeline needs, loaded once at startup.
#[derive(Clone, Debug)]
pub struct PromptSet {
    pub doc_type_check: PromptTemplate,
    pub extract_fields: PromptTemplate,
}

impl PromptSet {
    pub async fn load(settings: &Settings) -> Result<Self> {
        Ok(Self {
            doc_type_check: PromptTemplate::load(
                &settings.prompt_dir,
                "doc_type_check",
                &settings.doc_type_prompt_version,
            )
            .await?,
            extract_fields: PromptTemplate::load(
                &settings.prompt_dir,
                "extract_fields",
                &settings.extract_prompt_version,
            )
            .await?,
        })
    }
}
