//! Lossless stylesheet minification.
//!
//! Only comments and redundant whitespace are removed. Selectors, property
//! values and string literals are never rewritten, so nesting and `@layer`
//! survive untouched.

use std::collections::BTreeMap;

use crate::error::ResourceError;

use super::{ProcessedResourceData, ResourceBackend, ResourceDescriptor, ResourceKind, ResourceResult};

/// Characters around which whitespace is never significant.
fn is_punct(c: char) -> bool {
    matches!(c, '{' | '}' | ';' | ',')
}

/// Strip comments and collapse whitespace outside strings.
pub fn minify_css(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut chars = css.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            '"' | '\'' => {
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
                let mut escaped = false;
                for s in chars.by_ref() {
                    out.push(s);
                    if escaped {
                        escaped = false;
                    } else if s == '\\' {
                        escaped = true;
                    } else if s == c {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            '}' => {
                pending_space = false;
                if out.ends_with(';') {
                    out.pop();
                }
                out.push('}');
            }
            c => {
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
            }
        }
    }
    out
}

fn flush_space(out: &mut String, pending: &mut bool, next: char) {
    if *pending {
        let after_punct = out.chars().last().is_none_or(is_punct);
        if !after_punct && !is_punct(next) {
            out.push(' ');
        }
        *pending = false;
    }
}

/// The stylesheet backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct StylesheetMinifier;

impl ResourceBackend for StylesheetMinifier {
    fn name(&self) -> &str {
        "stylesheet-minifier"
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Stylesheet
    }

    fn process(&self, descriptor: &ResourceDescriptor) -> ResourceResult<ProcessedResourceData> {
        let source = std::str::from_utf8(&descriptor.bytes).map_err(|e| ResourceError::Decode {
            resource: descriptor.id.clone(),
            message: format!("stylesheet is not UTF-8: {e}"),
        })?;
        let text = if descriptor.params.minify {
            minify_css(source)
        } else {
            source.to_string()
        };
        let metadata = BTreeMap::from([
            ("original_size".to_string(), source.len().to_string()),
            ("size".to_string(), text.len().to_string()),
            ("minified".to_string(), descriptor.params.minify.to_string()),
        ]);
        Ok(ProcessedResourceData {
            width: None,
            height: None,
            format: "css".into(),
            bytes: text.into_bytes(),
            metadata,
        })
    }
}
