use std::collections::BTreeMap;

use thiserror::Error;

use crate::TimePoint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {template:?}: unknown placeholder {{{name}}}")]
    UnknownPlaceholder { template: String, name: String },
    #[error("template {template:?}: placeholder {{date}} used without a time point")]
    MissingTime { template: String },
    #[error("template {template:?}: unterminated placeholder")]
    Unterminated { template: String },
    #[error("template {template:?}: bad format spec {spec:?} for {{{name}}}")]
    BadSpec { template: String, name: String, spec: String },
}

/// Render a path template.
///
/// Placeholders:
/// - `{date}` -> `YYYYmmdd_HHMMSS`
/// - `{date:%Y/%m/%d}` -> strftime of the time point
/// - `{name}` -> selection parameter `name`
/// - `{name:04}` -> selection parameter left-padded with zeros to width 4
///
/// `{{` and `}}` are literal braces.
pub fn render_template(
    template: &str,
    time: Option<TimePoint>,
    params: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(TemplateError::Unterminated { template: template.to_string() });
                }
                let (name, spec) = match body.split_once(':') {
                    Some((n, s)) => (n.trim(), Some(s)),
                    None => (body.trim(), None),
                };
                out.push_str(&expand(template, name, spec, time, params)?);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn expand(
    template: &str,
    name: &str,
    spec: Option<&str>,
    time: Option<TimePoint>,
    params: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    if name == "date" {
        let t = time.ok_or_else(|| TemplateError::MissingTime { template: template.to_string() })?;
        return match spec {
            Some(fmt) => t.format(fmt).ok_or_else(|| TemplateError::BadSpec {
                template: template.to_string(),
                name: name.to_string(),
                spec: fmt.to_string(),
            }),
            None => Ok(t.to_filename_stamp()),
        };
    }

    let value = params.get(name).ok_or_else(|| TemplateError::UnknownPlaceholder {
        template: template.to_string(),
        name: name.to_string(),
    })?;

    match spec {
        None => Ok(value.clone()),
        Some(spec) => {
            let width = spec
                .strip_prefix('0')
                .map(|w| w.strip_suffix('d').unwrap_or(w))
                .and_then(|w| w.parse::<usize>().ok())
                .ok_or_else(|| TemplateError::BadSpec {
                    template: template.to_string(),
                    name: name.to_string(),
                    spec: spec.to_string(),
                })?;
            Ok(format!("{:0>width$}", value, width = width))
        }
    }
}
