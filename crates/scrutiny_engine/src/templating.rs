//! Mustache-subset rendering for messages and tag templates: `{{name}}`
//! substitution only, with one quirk: `${{...}}` regions come out as literal
//! `${...}` while `{{...}}` blocks nested inside them are still substituted
//! (`${{ {{x}} }}` with `x=foo` renders `${foo}`).

use handlebars::Handlebars;
use lazy_static::lazy_static;
use serde_json::{Map, Value};

lazy_static! {
    static ref REGISTRY: Handlebars<'static> = {
        let mut registry = Handlebars::new();
        // Values are rendered into plain-text messages, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry
    };
}

pub(crate) fn render(
    template: &str,
    variables: &Map<String, Value>,
) -> Result<String, handlebars::RenderError> {
    let (protected, bodies) = protect_dollar_braces(template);
    let data = Value::Object(variables.clone());
    let mut rendered = REGISTRY.render_template(&protected, &data)?;
    for (index, body) in bodies.iter().enumerate() {
        let inner = REGISTRY.render_template(body, &data)?;
        rendered = rendered.replace(&placeholder(index), &format!("${{{}}}", inner.trim()));
    }
    Ok(rendered)
}

/// Replace each `${{...}}` region with a control-character placeholder the
/// template engine passes through untouched, returning the regions' bodies
/// for separate rendering.
fn protect_dollar_braces(template: &str) -> (String, Vec<String>) {
    let mut output = String::new();
    let mut bodies = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match find_closing(after) {
            Some(end) => {
                output.push_str(&placeholder(bodies.len()));
                bodies.push(after[..end].to_string());
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated region: leave everything as-is.
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    (output, bodies)
}

/// Index of the `}}` closing a `${{`, skipping over nested `{{ }}` pairs.
fn find_closing(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            if depth == 0 {
                return Some(i);
            }
            depth -= 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

fn placeholder(index: usize) -> String {
    format!("\u{1}{index}\u{2}")
}
