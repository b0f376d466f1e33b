//! Static mapping from a language to the container image and command that
//! run it. Built once at startup and shared read-only across executions.

use std::collections::HashMap;
use std::sync::Arc;

use super::Language;
use crate::config::{SandboxConfig, UnknownLanguagePolicy};
use crate::errors::SandboxError;

const FILE_PLACEHOLDER: &str = "{file}";
const DEFAULT_LANGUAGE: Language = Language::Python;

#[derive(Debug, Clone, PartialEq)]
pub struct LanguageRuntime {
    pub language: Language,
    pub image: String,
    /// Includes the leading dot, e.g. ".py".
    pub file_extension: String,
    command: Vec<String>,
}

impl LanguageRuntime {
    pub fn new(
        language: Language,
        image: impl Into<String>,
        file_extension: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            language,
            image: image.into(),
            file_extension: normalize_extension(&file_extension.into()),
            command,
        }
    }

    pub fn builtin(language: Language) -> Self {
        let (image, extension, command): (&str, &str, &[&str]) = match language {
            Language::Python => ("python:3.11-slim", ".py", &["python", "{file}"]),
            Language::JavaScript => ("node:18-alpine", ".js", &["node", "{file}"]),
            Language::TypeScript => (
                "denoland/deno:alpine",
                ".ts",
                &["deno", "run", "--quiet", "{file}"],
            ),
            Language::Java => ("eclipse-temurin:17-jdk", ".java", &["java", "{file}"]),
            Language::Go => ("golang:1.21-alpine", ".go", &["go", "run", "{file}"]),
            // One argv has to cover both the compile and the run step
            Language::Rust => (
                "rust:1.75-slim",
                ".rs",
                &["sh", "-c", "rustc -o /tmp/main {file} && /tmp/main"],
            ),
            Language::Ruby => ("ruby:3.2-slim", ".rb", &["ruby", "{file}"]),
            Language::Php => ("php:8.2-cli", ".php", &["php", "{file}"]),
        };

        Self::new(
            language,
            image,
            extension,
            command.iter().map(|part| part.to_string()).collect(),
        )
    }

    /// Name of the source file written into the workspace
    pub fn source_file_name(&self) -> String {
        format!("main{}", self.file_extension)
    }

    pub fn command_for(&self, filename: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|part| part.replace(FILE_PLACEHOLDER, filename))
            .collect()
    }
}

fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim();
    if trimmed.starts_with('.') {
        trimmed.to_string()
    } else {
        format!(".{}", trimmed)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeCatalog {
    runtimes: HashMap<Language, Arc<LanguageRuntime>>,
    unknown_language: UnknownLanguagePolicy,
}

impl RuntimeCatalog {
    pub fn builtin() -> Self {
        let runtimes = Language::ALL
            .iter()
            .map(|language| (*language, Arc::new(LanguageRuntime::builtin(*language))))
            .collect();

        Self {
            runtimes,
            unknown_language: UnknownLanguagePolicy::Reject,
        }
    }

    /// Built-in catalog with the configured per-language overrides applied
    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let mut catalog = Self::builtin();
        catalog.unknown_language = config.execution.unknown_language;

        for (tag, overrides) in &config.runtimes {
            let language: Language = tag.parse().map_err(|_| {
                SandboxError::ConfigError(format!(
                    "Runtime override for unknown language '{}'",
                    tag
                ))
            })?;

            let base = catalog.get(language);
            let runtime = LanguageRuntime::new(
                language,
                overrides.image.clone().unwrap_or_else(|| base.image.clone()),
                overrides
                    .extension
                    .clone()
                    .unwrap_or_else(|| base.file_extension.clone()),
                overrides.command.clone().unwrap_or_else(|| base.command.clone()),
            );
            log::debug!("Runtime for {} overridden: image {}", language, runtime.image);
            catalog.runtimes.insert(language, Arc::new(runtime));
        }

        Ok(catalog)
    }

    pub fn get(&self, language: Language) -> Arc<LanguageRuntime> {
        self.runtimes
            .get(&language)
            .cloned()
            .unwrap_or_else(|| Arc::new(LanguageRuntime::builtin(language)))
    }

    /// Map a language tag to a known language, honoring the fallback policy
    pub fn resolve_language(&self, tag: &str) -> Result<Language, SandboxError> {
        match tag.parse::<Language>() {
            Ok(language) => Ok(language),
            Err(err) => match self.unknown_language {
                UnknownLanguagePolicy::Reject => Err(err),
                UnknownLanguagePolicy::Fallback => {
                    log::warn!(
                        "Unknown language '{}', falling back to {}",
                        tag,
                        DEFAULT_LANGUAGE
                    );
                    Ok(DEFAULT_LANGUAGE)
                }
            },
        }
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<LanguageRuntime>, SandboxError> {
        self.resolve_language(tag).map(|language| self.get(language))
    }

    pub fn languages(&self) -> Vec<Language> {
        Language::ALL.to_vec()
    }
}
