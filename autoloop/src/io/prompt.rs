//! Prompt builder for phase attempts.
//!
//! The plan artifact is read on every call since plans may be edited between
//! iterations. Nothing is cached and no state survives a call.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

const PHASE_TEMPLATE: &str = include_str!("prompts/phase.md");

/// Default byte budget for a rendered prompt.
pub const DEFAULT_PROMPT_BUDGET: usize = 200_000;

/// Stand-ins rendered in place of free text; substituted after section parsing
/// so markers inside the plan or feedback cannot split sections.
const PLAN_SLOT: &str = "\u{1}autoloop:plan\u{1}";
const FEEDBACK_SLOT: &str = "\u{1}autoloop:feedback\u{1}";

const EMPTY_PLAN_NOTE: &str = "(The plan artifact is empty. Verify the phase and finish.)";

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 2] = ["feedback", "issues"];

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("phase", PHASE_TEMPLATE)
        .expect("phase template should be valid");
    env
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("plan artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },
    #[error("plan artifact {} could not be read", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt template failed to render")]
    Render(#[from] minijinja::Error),
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Builds phase prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Prompt for `phase_id` of the plan at `plan_path`.
    pub fn build(&self, plan_path: &Path, phase_id: &str) -> Result<String, PromptError> {
        self.build_with_feedback(plan_path, phase_id, &[], None)
    }

    /// Like [`build`](Self::build), adding the phase's tracked issues and a
    /// summary of why the previous attempt failed.
    pub fn build_with_feedback(
        &self,
        plan_path: &Path,
        phase_id: &str,
        issue_ids: &[String],
        feedback: Option<&str>,
    ) -> Result<String, PromptError> {
        let plan = read_plan(plan_path)?;
        let feedback = feedback.map(str::trim).filter(|s| !s.is_empty());

        let rendered = ENV.get_template("phase")?.render(context! {
            phase_id => phase_id,
            plan_path => plan_path.display().to_string(),
            plan => PLAN_SLOT,
            issues => issue_ids,
            feedback => feedback.map(|_| FEEDBACK_SLOT),
        })?;

        let plan_text = if plan.trim().is_empty() {
            EMPTY_PLAN_NOTE
        } else {
            plan.trim_end()
        };
        let mut sections = parse_sections(&rendered);
        for section in &mut sections {
            section.content = section
                .content
                .replace(PLAN_SLOT, plan_text)
                .replace(FEEDBACK_SLOT, feedback.unwrap_or_default());
        }
        apply_budget(&mut sections, self.budget_bytes);

        let prompt = sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        debug!(phase = phase_id, bytes = prompt.len(), "prompt built");
        Ok(prompt)
    }
}

fn read_plan(path: &Path) -> Result<String, PromptError> {
    if !path.exists() {
        return Err(PromptError::ArtifactNotFound {
            path: path.to_path_buf(),
        });
    }
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            PromptError::ArtifactNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PromptError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections until the prompt fits. Required sections are
/// never dropped or truncated, so a large plan may still exceed the budget.
fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total_len = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped section for budget"
            );
        }
    }
    if total_len(sections) > budget {
        debug!(
            budget,
            bytes = total_len(sections),
            "required sections exceed prompt budget"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plan(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("plan.md");
        fs::write(&path, content).expect("write plan");
        path
    }

    #[test]
    fn prompt_contains_plan_and_phase_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = write_plan(temp.path(), "# Plan\n## Phase X");

        let prompt = PromptBuilder::default().build(&plan, "X").expect("build");

        assert!(prompt.contains("# Plan\n## Phase X"));
        assert!(prompt.contains("phase `X`"));
        assert!(prompt.contains("Run the project's tests"));
        assert!(prompt.contains("bd sync"));
    }

    #[test]
    fn missing_plan_is_artifact_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing.md");

        let err = PromptBuilder::default().build(&missing, "X").unwrap_err();
        assert!(matches!(err, PromptError::ArtifactNotFound { ref path } if path == &missing));
    }

    #[test]
    fn plan_is_reread_on_every_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = write_plan(temp.path(), "first draft");
        let builder = PromptBuilder::default();
        assert!(builder.build(&plan, "1").expect("build").contains("first draft"));

        fs::write(&plan, "second draft").expect("rewrite");
        assert!(builder.build(&plan, "1").expect("build").contains("second draft"));

        fs::remove_file(&plan).expect("remove");
        assert!(matches!(
            builder.build(&plan, "1"),
            Err(PromptError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn empty_plan_still_builds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = write_plan(temp.path(), "");

        let prompt = PromptBuilder::default().build(&plan, "verify").expect("build");
        assert!(prompt.contains("phase `verify`"));
        assert!(prompt.contains("## Instructions"));
        assert!(prompt.contains(EMPTY_PLAN_NOTE));
    }

    #[test]
    fn feedback_and_issues_are_included() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = write_plan(temp.path(), "# Plan");
        let issues = vec!["I-1".to_string(), "I-2".to_string()];

        let prompt = PromptBuilder::default()
            .build_with_feedback(&plan, "1", &issues, Some("open issues: I-2"))
            .expect("build");

        assert!(prompt.contains("## Tracked issues"));
        assert!(prompt.contains("- I-1\n- I-2"));
        assert!(prompt.contains("## Previous attempt"));
        assert!(prompt.contains("open issues: I-2"));
        let plan_pos = prompt.find("# Plan").expect("plan");
        let feedback_pos = prompt.find("## Previous attempt").expect("feedback");
        let instructions_pos = prompt.find("## Instructions").expect("instructions");
        assert!(plan_pos < feedback_pos && feedback_pos < instructions_pos);
    }

    #[test]
    fn plan_content_with_section_markers_is_kept_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let content = "intro\n<!-- section:feedback droppable -->\nmore plan {{ not_a_var }}";
        let plan = write_plan(temp.path(), content);

        let prompt = PromptBuilder::new(10).build(&plan, "1").expect("build");
        assert!(prompt.contains(content));
    }

    #[test]
    fn budget_drops_feedback_before_issues_and_keeps_required() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = write_plan(temp.path(), &"plan line\n".repeat(50));
        let issues = vec!["I-1".to_string()];
        let feedback = "stderr noise ".repeat(500);
        let builder = PromptBuilder::default();

        let full = builder
            .build_with_feedback(&plan, "1", &issues, Some(&feedback))
            .expect("build");
        let without_feedback = builder
            .build_with_feedback(&plan, "1", &issues, None)
            .expect("build");

        let tight = PromptBuilder::new(without_feedback.len())
            .build_with_feedback(&plan, "1", &issues, Some(&feedback))
            .expect("build");
        assert!(full.contains("## Previous attempt"));
        assert!(!tight.contains("## Previous attempt"));
        assert!(tight.contains("## Tracked issues"));

        let minimal = PromptBuilder::new(1)
            .build_with_feedback(&plan, "1", &issues, Some(&feedback))
            .expect("build");
        assert!(!minimal.contains("## Tracked issues"));
        assert!(minimal.contains(&"plan line\n".repeat(49)));
        assert!(minimal.contains("## Instructions"));
    }
}
