//! Prompt builder for agent dispatches.
//!
//! Templates carry `<!-- section:KEY required|droppable -->` markers; when a
//! rendered prompt exceeds the byte budget, droppable sections go first.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::WorkItem;

const EXECUTE_TEMPLATE: &str = include_str!("prompts/execute.md");
const DECOMPOSE_TEMPLATE: &str = include_str!("prompts/decompose.md");

/// Children an epic decomposition must produce.
pub const MIN_CHILDREN: usize = 5;
pub const MAX_CHILDREN: usize = 10;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

/// Work item as exposed to templates.
#[derive(Debug, Clone, Serialize)]
struct ItemContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    kind: &'a str,
    priority: u8,
}

impl<'a> ItemContext<'a> {
    fn from_item(item: &'a WorkItem) -> Self {
        Self {
            id: &item.id,
            title: &item.title,
            description: item.description.trim(),
            kind: item.kind.map_or("unknown", |k| k.as_str()),
            priority: item.priority,
        }
    }
}

/// Inputs for one dispatch prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub worker_id: &'a str,
    pub item: &'a WorkItem,
    pub output_path: &'a Path,
    /// JSON Schema the agent output must satisfy.
    pub schema: &'a str,
    /// 1-based dispatch count for this claim.
    pub attempt: u32,
    /// Failure context from the previous attempt.
    pub failure: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
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
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop order: description, then failure. Required sections are kept whole.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    for key in ["description", "failure"] {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds dispatch prompts within a byte budget.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("execute", EXECUTE_TEMPLATE)
            .context("load execute template")?;
        env.add_template("decompose", DECOMPOSE_TEMPLATE)
            .context("load decompose template")?;
        Ok(Self { env, budget_bytes })
    }

    /// Prompt for implementing a leaf item (task, bug, feature).
    pub fn build_execute(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("execute")?
            .render(context! {
                worker_id => input.worker_id,
                item => ItemContext::from_item(input.item),
                output_path => input.output_path.display().to_string(),
                schema => input.schema.trim(),
                attempt => input.attempt,
                failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render execute prompt")?;
        Ok(self.finish(&rendered))
    }

    /// Prompt for splitting an epic into children.
    pub fn build_decompose(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("decompose")?
            .render(context! {
                worker_id => input.worker_id,
                item => ItemContext::from_item(input.item),
                output_path => input.output_path.display().to_string(),
                schema => input.schema.trim(),
                min_children => MIN_CHILDREN,
                max_children => MAX_CHILDREN,
                failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render decompose prompt")?;
        Ok(self.finish(&rendered))
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}
