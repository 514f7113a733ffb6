//! Entrypoint argument templates
//!
//! A template such as `{{ forEach.currentValue }} {{ forEach.outputPath }} {{ arguments.as_str }}`
//! is split into tokens first (quotes group words and are removed), then each
//! `{{ path }}` reference is resolved against a JSON context. Substituted
//! values never re-split a token; a token that is exactly one reference to an
//! array expands into one argv entry per element.

use super::arguments::stringify;
use crate::common::json_path::lookup_path;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("reference pattern is valid")
});

/// Errors that can occur while rendering an argument template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A quote was opened but never closed
    #[error("Unterminated {quote} quote in argument template")]
    UnterminatedQuote {
        /// The quote character
        quote: char,
    },

    /// A `{{ path }}` reference did not resolve in the context
    #[error("Unknown template reference '{{{{ {reference} }}}}'")]
    UnknownReference {
        /// The dot-path that failed to resolve
        reference: String,
    },
}

/// Split an argument string on whitespace, honouring single and double quotes
///
/// Quotes are removed; adjacent quoted and unquoted text join into one token,
/// and `""` yields an empty token. A `{{ ... }}` reference is never split,
/// even when it contains spaces.
pub fn split_arguments(input: &str) -> Result<Vec<String>, TemplateError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '{' && chars.peek() == Some(&'{') {
            chars.next();
            current.push_str("{{");
            in_token = true;
            let mut previous = '\0';
            for inner in chars.by_ref() {
                current.push(inner);
                if previous == '}' && inner == '}' {
                    break;
                }
                previous = inner;
            }
            continue;
        }

        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if let Some(quote) = quote {
        return Err(TemplateError::UnterminatedQuote { quote });
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Render a template into argv entries using the given context
pub fn render_arguments(template: &str, context: &Value) -> Result<Vec<String>, TemplateError> {
    let mut argv = Vec::new();

    for token in split_arguments(template)? {
        if let Some(reference) = whole_reference(&token) {
            match resolve(context, reference)? {
                Value::Array(items) => argv.extend(items.iter().map(stringify)),
                value => argv.push(stringify(value)),
            }
            continue;
        }

        let mut rendered = String::with_capacity(token.len());
        let mut last = 0;
        for captures in REFERENCE.captures_iter(&token) {
            let (Some(whole), Some(path)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            rendered.push_str(&token[last..whole.start()]);
            rendered.push_str(&inline(resolve(context, path.as_str())?));
            last = whole.end();
        }
        rendered.push_str(&token[last..]);
        argv.push(rendered);
    }

    Ok(argv)
}

fn whole_reference(token: &str) -> Option<&str> {
    let captures = REFERENCE.captures(token)?;
    let whole = captures.get(0)?;
    if whole.start() == 0 && whole.end() == token.len() {
        captures.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn resolve<'a>(context: &'a Value, reference: &str) -> Result<&'a Value, TemplateError> {
    lookup_path(context, reference).ok_or_else(|| TemplateError::UnknownReference {
        reference: reference.to_string(),
    })
}

fn inline(value: &Value) -> String {
    match value {
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(" "),
        other => stringify(other),
    }
}
