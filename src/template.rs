//! Query template rendering
//!
//! Pure string substitution: `{attr}` placeholders are filled from the
//! entity's seed attributes. A placeholder with no matching attribute
//! substitutes the literal token `unknown` instead of failing the task; the
//! parser may later mark the result low-confidence, but automation keeps
//! moving.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::input::{Entity, FieldTemplate};

/// Substituted for placeholders the entity cannot fill.
pub const UNKNOWN_TOKEN: &str = "unknown";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Render a single field's query template for one entity.
pub fn render(template: &str, entity: &Entity) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let attr = &caps[1];
            entity
                .attribute(attr)
                .map(|v| v.to_string())
                .unwrap_or_else(|| UNKNOWN_TOKEN.to_string())
        })
        .into_owned()
}

/// Pack several field templates for one entity into a single exchange.
///
/// Each field's rendered prompt becomes a numbered question; a trailing
/// instruction pins the delimiter grammar (`value~url` pairs joined by `?`)
/// so the response parser has a stable format to split on. For a single
/// field this is just the rendered template plus the instruction.
pub fn render_group(templates: &[FieldTemplate], entity: &Entity) -> String {
    debug_assert!(!templates.is_empty());

    let mut prompt = String::new();
    if templates.len() == 1 {
        prompt.push_str(&render(&templates[0].template, entity));
    } else {
        prompt.push_str("Answer each of the following questions in order:\n");
        for (i, t) in templates.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, render(&t.template, entity)));
        }
    }

    prompt.push_str(&format!(
        "\nReturn exactly {count} answer(s) in a single line, each answer and \
         its most credible source URL separated by a tilde (~), and answers \
         separated by a question mark (?). Use N/A when no answer exists. Do \
         not provide any additional text or explanation. Format: {example}",
        count = templates.len(),
        example = format_example(templates.len()),
    ));

    prompt
}

fn format_example(count: usize) -> String {
    (1..=count)
        .map(|i| format!("answer{i}~url{i}"))
        .collect::<Vec<_>>()
        .join("?")
}
