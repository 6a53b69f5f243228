//! Prompt templates.
//!
//! A template file has a `SYSTEM:` section followed by a `USER:` section. `{name}`
//! placeholders are substituted from a [`PromptContext`]; names missing from the
//! context render as empty strings. Braces that do not wrap a bare identifier (JSON
//! examples in the prompt text) are left alone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::llm::ModelRequest;
use crate::pipeline::Stage;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Values substituted into templates.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    values: HashMap<String, String>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    system: String,
    user: String,
}

impl PromptTemplate {
    /// Parse template text. Text before `USER:` is the system part.
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let (system, user) = match text.find("USER:") {
            Some(idx) => (&text[..idx], &text[idx + "USER:".len()..]),
            None => ("", text),
        };
        let system = system.trim().strip_prefix("SYSTEM:").unwrap_or(system.trim());
        Self {
            name: name.into(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }

    fn substitute(text: &str, context: &PromptContext) -> String {
        placeholder()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                context.get(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned()
    }

    pub fn render(&self, context: &PromptContext) -> ModelRequest {
        ModelRequest::new(
            Self::substitute(&self.system, context),
            Self::substitute(&self.user, context),
        )
    }
}

/// Primary and strict-retry templates of one stage.
#[derive(Debug, Clone)]
pub struct StagePrompts {
    pub primary: PromptTemplate,
    pub retry: PromptTemplate,
}

/// Templates for all stages.
#[derive(Debug, Clone)]
pub struct PromptSet {
    extractor: StagePrompts,
    solver: StagePrompts,
    tagger: StagePrompts,
}

const BUILTIN: [(&str, &str); 6] = [
    ("ocr.txt", include_str!("prompts/ocr.txt")),
    ("ocr_retry.txt", include_str!("prompts/ocr_retry.txt")),
    ("solver.txt", include_str!("prompts/solver.txt")),
    ("solver_retry.txt", include_str!("prompts/solver_retry.txt")),
    ("tagger.txt", include_str!("prompts/tagger.txt")),
    ("tagger_retry.txt", include_str!("prompts/tagger_retry.txt")),
];

impl PromptSet {
    /// Built-in templates compiled into the binary.
    pub fn builtin() -> Self {
        Self::from_source(|name| {
            BUILTIN
                .iter()
                .find(|(file, _)| *file == name)
                .map(|(_, text)| text.to_string())
                .unwrap_or_default()
        })
    }

    /// Built-ins overridden by any same-named file found in `dir`.
    pub fn load(dir: Option<&Path>) -> std::io::Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::builtin());
        };
        let mut overrides = HashMap::new();
        for (file, _) in BUILTIN {
            let path = dir.join(file);
            if path.exists() {
                overrides.insert(file, std::fs::read_to_string(&path)?);
                tracing::info!(path = %path.display(), "Loaded prompt override");
            }
        }
        let builtin = Self::builtin();
        let pick = |file: &str, fallback: &PromptTemplate| match overrides.get(file) {
            Some(text) => PromptTemplate::parse(file, text),
            None => fallback.clone(),
        };
        Ok(Self {
            extractor: StagePrompts {
                primary: pick("ocr.txt", &builtin.extractor.primary),
                retry: pick("ocr_retry.txt", &builtin.extractor.retry),
            },
            solver: StagePrompts {
                primary: pick("solver.txt", &builtin.solver.primary),
                retry: pick("solver_retry.txt", &builtin.solver.retry),
            },
            tagger: StagePrompts {
                primary: pick("tagger.txt", &builtin.tagger.primary),
                retry: pick("tagger_retry.txt", &builtin.tagger.retry),
            },
        })
    }

    fn from_source(read: impl Fn(&str) -> String) -> Self {
        let pair = |primary: &str, retry: &str| StagePrompts {
            primary: PromptTemplate::parse(primary, &read(primary)),
            retry: PromptTemplate::parse(retry, &read(retry)),
        };
        Self {
            extractor: pair("ocr.txt", "ocr_retry.txt"),
            solver: pair("solver.txt", "solver_retry.txt"),
            tagger: pair("tagger.txt", "tagger_retry.txt"),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &StagePrompts {
        match stage {
            Stage::Extractor => &self.extractor,
            Stage::Solver => &self.solver,
            Stage::Tagger => &self.tagger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let template = PromptTemplate::parse(
            "t",
            "SYSTEM:\nYou solve {subject} problems.\nUSER:\nProblem: {problem_text}\nHint: {missing}\nReturn {\"answer\": \"...\"}",
        );
        let request = template.render(
            &PromptContext::new()
                .with("subject", "math")
                .with("problem_text", "2x+3=7"),
        );
        assert_eq!(request.system_prompt, "You solve math problems.");
        assert!(request.user_prompt.contains("Problem: 2x+3=7"));
        assert!(request.user_prompt.contains("Hint: \n"));
        assert!(request.user_prompt.contains("{\"answer\": \"...\"}"));
    }

    #[test]
    fn test_template_without_system_section() {
        let template = PromptTemplate::parse("t", "just {x}");
        let request = template.render(&PromptContext::new().with("x", "user text"));
        assert_eq!(request.system_prompt, "");
        assert_eq!(request.user_prompt, "just user text");
    }

    #[test]
    fn test_builtin_templates_have_both_sections() {
        let prompts = PromptSet::builtin();
        for stage in Stage::ALL {
            let pair = prompts.for_stage(stage);
            let primary = pair.primary.render(&PromptContext::new());
            let retry = pair.retry.render(&PromptContext::new());
            assert!(!primary.system_prompt.is_empty(), "{} system", stage);
            assert!(!primary.user_prompt.is_empty(), "{} user", stage);
            assert_ne!(primary.system_prompt, retry.system_prompt, "{} retry is stricter", stage);
        }
    }

    #[test]
    fn test_directory_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("solver.txt"), "SYSTEM:\ncustom\nUSER:\n{problem_text}").unwrap();
        let prompts = PromptSet::load(Some(dir.path())).unwrap();
        let request = prompts
            .for_stage(Stage::Solver)
            .primary
            .render(&PromptContext::new().with("problem_text", "p"));
        assert_eq!(request.system_prompt, "custom");
        assert_eq!(request.user_prompt, "p");
    }
}
