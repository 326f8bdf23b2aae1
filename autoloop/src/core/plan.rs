//! Phase discovery from plan artifacts.
//!
//! A plan is a markdown document. Each `## Phase <id>` heading opens a phase,
//! and `Issues: A, B` lines inside that section name the tracked issues the
//! phase must close. A plan without phase headings is a single phase named
//! after the file stem.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::id::validate_id;
use crate::core::types::Phase;

static PHASE_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+Phase\s+(\S+)").expect("phase heading regex should be valid")
});

static ISSUES_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*]?\s*\**issues\**\s*:\s*\**\s*(.+)$")
        .expect("issues line regex should be valid")
});

/// Discover phases in document order.
pub fn discover_phases(plan_path: &Path, content: &str) -> Result<Vec<Phase>> {
    let mut phases: Vec<Phase> = Vec::new();

    for line in content.lines() {
        if let Some(caps) = PHASE_HEADING_RE.captures(line) {
            let id = caps[1].trim_end_matches([':', '.', ')']).to_string();
            validate_id(&id).with_context(|| format!("malformed phase id in heading '{line}'"))?;
            if phases.iter().any(|p| p.id == id) {
                return Err(anyhow!("duplicate phase id '{id}'"));
            }
            let ordinal = phases.len();
            phases.push(Phase::new(id, plan_path, ordinal));
            continue;
        }
        if let Some(caps) = ISSUES_LINE_RE.captures(line)
            && let Some(current) = phases.last_mut()
        {
            let issues = parse_issue_list(&caps[1])
                .with_context(|| format!("malformed issue list in phase '{}': '{line}'", current.id))?;
            for issue in issues {
                if !current.issue_ids.contains(&issue) {
                    current.issue_ids.push(issue);
                }
            }
        }
    }

    if phases.is_empty() {
        let stem = plan_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("plan path has no usable file stem {}", plan_path.display()))?;
        validate_id(stem).with_context(|| {
            format!("plan file stem is not a valid phase id {}", plan_path.display())
        })?;
        phases.push(Phase::new(stem, plan_path, 0));
    }

    Ok(phases)
}

/// Values of an `Issues:` line that mean the phase tracks nothing.
const NO_ISSUES: &[&str] = &["none", "n/a", "-"];

/// Split an `Issues:` value into ids. Every token must look like a tracker id
/// (a valid id containing a digit or a `-`), so prose such as "I-1 and I-2" is
/// rejected instead of becoming an issue that can never close.
fn parse_issue_list(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim().trim_matches(|c| c == '`' || c == '*').trim();
    if NO_ISSUES.iter().any(|none| raw.eq_ignore_ascii_case(none)) {
        return Ok(Vec::new());
    }
    raw.split([',', ';', ' ', '\t'])
        .map(|s| {
            s.trim()
                .trim_matches(|c| c == '`' || c == '*')
                .trim_end_matches('.')
        })
        .filter(|s| !s.is_empty())
        .map(|token| {
            validate_id(token).with_context(|| format!("malformed issue id '{token}'"))?;
            if !token.chars().any(|c| c.is_ascii_digit() || c == '-') {
                return Err(anyhow!(
                    "'{token}' does not look like an issue id (expected e.g. I-1 or bd-a1b2)"
                ));
            }
            Ok(token.to_string())
        })
        .collect()
}
