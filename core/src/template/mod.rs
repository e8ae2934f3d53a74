//! Template interpolation
//!
//! Templates are strings with `{{ expr }}` placeholders interleaved with
//! literal text. Each placeholder holds one access path rooted at a context
//! variable (or a loop binding such as `$loopElement`), for example
//! `$loopElement.data[0].uri` or `uriList[0]["dev"]`.
//!
//! Templates are parsed once, when a scenario is compiled, and evaluated many
//! times against per-run contexts. Evaluation never mutates the context.
//!
//! ## Missing values
//!
//! A path whose root or any intermediate accessor is absent resolves to the
//! empty string, never an error. `null` values stringify the same way.
//!
//! ## Nested templates
//!
//! A substituted string that itself contains `{{` is parsed and resolved
//! again against the same context. This lets a loop element carry a template
//! (`{"uri": "{{ uriList[0] }}"}`) that is only resolved once a hook has
//! produced `uriList`. Nesting is bounded by [`Interpolator::max_depth`].

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::context::Context;

#[cfg(test)]
mod tests;

/// Default bound on nested template passes
pub const DEFAULT_MAX_DEPTH: usize = 8;

/* ===================== Parser ===================== */

#[derive(Parser)]
#[grammar = "template/template.pest"]
struct TemplateParser;

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template does not match the placeholder grammar
    #[error("invalid template `{template}`: {message}")]
    Syntax { template: String, message: String },

    /// An array or object was substituted into surrounding text
    #[error("`{path}` resolved to {found}, which cannot be embedded in text")]
    NonScalarSubstitution { path: String, found: &'static str },

    /// Nested templates kept producing more templates
    #[error("template `{template}` is nested deeper than {limit} levels")]
    DepthExceeded { template: String, limit: usize },
}

/* ===================== AST ===================== */

/// One accessor in a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    /// `.name` or `["name"]`
    Key(String),
    /// `[0]`
    Index(usize),
}

/// A placeholder expression: root identifier plus accessor chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub root: String,
    pub accessors: Vec<Accessor>,
}

impl Path {
    /// Walk the path through the context.
    ///
    /// Returns `None` as soon as the root or any accessor misses.
    pub fn lookup<'c>(&self, context: &'c Context) -> Option<&'c Value> {
        let mut current = context.lookup(&self.root)?;

        for accessor in &self.accessors {
            current = match (accessor, current) {
                (Accessor::Index(idx), Value::Array(items)) => items.get(*idx)?,
                (Accessor::Key(key), Value::Object(map)) => map.get(key)?,
                // `items.0` indexes like `items[0]`
                (Accessor::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for accessor in &self.accessors {
            match accessor {
                Accessor::Index(idx) => write!(f, "[{}]", idx)?,
                Accessor::Key(key) if is_identifier(key) => write!(f, ".{}", key)?,
                Accessor::Key(key) => write!(f, "[{:?}]", key)?,
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-')
}

/// A template segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Path),
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template string.
    ///
    /// Any `{{` that does not open a well-formed placeholder is rejected.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let syntax_error = |message: String| TemplateError::Syntax {
            template: source.to_string(),
            message,
        };

        let mut pairs = TemplateParser::parse(Rule::template, source)
            .map_err(|e| syntax_error(e.variant.message().into_owned()))?;

        let template = pairs
            .next()
            .ok_or_else(|| syntax_error("empty parse".to_string()))?;

        let mut segments = Vec::new();
        for pair in template.into_inner() {
            match pair.as_rule() {
                Rule::literal => segments.push(Segment::Literal(pair.as_str().to_string())),
                Rule::placeholder => {
                    let path = pair
                        .into_inner()
                        .next()
                        .ok_or_else(|| syntax_error("placeholder without a path".to_string()))?;
                    segments.push(Segment::Placeholder(build_path(path).map_err(syntax_error)?));
                }
                Rule::EOI => {}
                rule => return Err(syntax_error(format!("unexpected {:?}", rule))),
            }
        }

        Ok(Template {
            source: source.to_string(),
            segments,
        })
    }

    /// A template holding only literal text
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.clone())]
        };
        Template {
            source: text,
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the template has no placeholders
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// The path when the whole template is exactly one placeholder
    pub fn sole_placeholder(&self) -> Option<&Path> {
        match self.segments.as_slice() {
            [Segment::Placeholder(path)] => Some(path),
            _ => None,
        }
    }

    /// Render to a string with the default nesting bound
    pub fn render(&self, context: &Context) -> Result<String, TemplateError> {
        Interpolator::default().render(self, context)
    }

    /// Resolve to a value with the default nesting bound
    pub fn resolve(&self, context: &Context) -> Result<Value, TemplateError> {
        Interpolator::default().resolve(self, context)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn build_path(pair: Pair<Rule>) -> Result<Path, String> {
    let mut inner = pair.into_inner();
    let root = inner
        .next()
        .ok_or_else(|| "path without a root".to_string())?
        .as_str()
        .to_string();

    let mut accessors = Vec::new();
    for access in inner {
        let rule = access.as_rule();
        let token = access
            .into_inner()
            .next()
            .ok_or_else(|| format!("empty {:?}", rule))?;

        let accessor = match rule {
            Rule::dot_access | Rule::key_access => Accessor::Key(token.as_str().to_string()),
            Rule::index_access => {
                let idx = token
                    .as_str()
                    .parse::<usize>()
                    .map_err(|e| format!("index `{}` out of range: {}", token.as_str(), e))?;
                Accessor::Index(idx)
            }
            other => return Err(format!("unexpected {:?}", other)),
        };
        accessors.push(accessor);
    }

    Ok(Path { root, accessors })
}

/* ===================== Evaluation ===================== */

/// Evaluates templates against a context with a bound on nested passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpolator {
    max_depth: usize,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Interpolator {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Render a template to a string
    ///
    /// Scalars are substituted in canonical form; arrays and objects are
    /// rejected with [`TemplateError::NonScalarSubstitution`].
    pub fn render(&self, template: &Template, context: &Context) -> Result<String, TemplateError> {
        self.render_at(template, context, 0)
    }

    /// Resolve a template to a value
    ///
    /// A template that is exactly one placeholder yields the raw value it
    /// points at (arrays and objects included). Anything else renders to a
    /// string value.
    pub fn resolve(&self, template: &Template, context: &Context) -> Result<Value, TemplateError> {
        self.resolve_at(template, context, 0)
    }

    fn resolve_at(
        &self,
        template: &Template,
        context: &Context,
        depth: usize,
    ) -> Result<Value, TemplateError> {
        let Some(path) = template.sole_placeholder() else {
            return self.render_at(template, context, depth).map(Value::String);
        };

        match path.lookup(context) {
            None => {
                debug!(path = %path, "unresolved template path, substituting empty string");
                Ok(Value::String(String::new()))
            }
            Some(Value::String(s)) if s.contains("{{") => match self.nested(s, depth)? {
                Some(inner) => self.resolve_at(&inner, context, depth + 1),
                None => Ok(Value::String(s.clone())),
            },
            Some(value) => Ok(value.clone()),
        }
    }

    fn render_at(
        &self,
        template: &Template,
        context: &Context,
        depth: usize,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.source.len());

        for segment in &template.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(path) => match path.lookup(context) {
                    None => {
                        debug!(path = %path, "unresolved template path, substituting empty string");
                    }
                    Some(value) => out.push_str(&self.stringify(path, value, context, depth)?),
                },
            }
        }

        Ok(out)
    }

    fn stringify(
        &self,
        path: &Path,
        value: &Value,
        context: &Context,
        depth: usize,
    ) -> Result<String, TemplateError> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(format_number(n)),
            Value::String(s) if s.contains("{{") => match self.nested(s, depth)? {
                Some(inner) => self.render_at(&inner, context, depth + 1),
                None => Ok(s.clone()),
            },
            Value::String(s) => Ok(s.clone()),
            other => Err(TemplateError::NonScalarSubstitution {
                path: path.to_string(),
                found: kind_name(other),
            }),
        }
    }

    /// Parse a substituted string as a nested template.
    ///
    /// Strings that do not parse are substituted verbatim (`Ok(None)`).
    fn nested(&self, source: &str, depth: usize) -> Result<Option<Template>, TemplateError> {
        let Ok(template) = Template::parse(source) else {
            return Ok(None);
        };

        if depth >= self.max_depth {
            return Err(TemplateError::DepthExceeded {
                template: source.to_string(),
                limit: self.max_depth,
            });
        }

        Ok(Some(template))
    }
}

/// Parse and render in one go
pub fn resolve(template: &str, context: &Context) -> Result<String, TemplateError> {
    Template::parse(template)?.render(context)
}

/// Parse and resolve to a value in one go
pub fn resolve_value(template: &str, context: &Context) -> Result<Value, TemplateError> {
    Template::parse(template)?.resolve(context)
}

/// Canonical string form of a number
///
/// Integral floats drop their fractional part (`2.0` renders as `2`).
pub fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }

    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Human readable name of a value's type, for error messages
pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/* ===================== Value Templates ===================== */

/// A JSON tree whose templated string leaves are pre-parsed
///
/// Used for request bodies: `{"id": "{{ userId }}", "tags": ["a", "{{ tag }}"]}`.
/// Templated leaves resolve in value mode, so `"{{ ids }}"` can produce an array.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTemplate {
    Literal(Value),
    Text(Template),
    Array(Vec<ValueTemplate>),
    Object(Vec<(String, ValueTemplate)>),
}

impl ValueTemplate {
    pub fn compile(value: &Value) -> Result<Self, TemplateError> {
        let compiled = match value {
            Value::String(s) if s.contains("{{") => ValueTemplate::Text(Template::parse(s)?),
            Value::Array(items) => ValueTemplate::Array(
                items
                    .iter()
                    .map(ValueTemplate::compile)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => ValueTemplate::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), ValueTemplate::compile(v)?)))
                    .collect::<Result<_, TemplateError>>()?,
            ),
            other => return Ok(ValueTemplate::Literal(other.clone())),
        };

        if compiled.is_literal() {
            return Ok(ValueTemplate::Literal(value.clone()));
        }
        Ok(compiled)
    }

    fn is_literal(&self) -> bool {
        match self {
            ValueTemplate::Literal(_) => true,
            ValueTemplate::Text(_) => false,
            ValueTemplate::Array(items) => items.iter().all(ValueTemplate::is_literal),
            ValueTemplate::Object(entries) => entries.iter().all(|(_, v)| v.is_literal()),
        }
    }

    pub fn resolve(
        &self,
        interpolator: &Interpolator,
        context: &Context,
    ) -> Result<Value, TemplateError> {
        match self {
            ValueTemplate::Literal(value) => Ok(value.clone()),
            ValueTemplate::Text(template) => interpolator.resolve(template, context),
            ValueTemplate::Array(items) => items
                .iter()
                .map(|item| item.resolve(interpolator, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ValueTemplate::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, item) in entries {
                    map.insert(key.clone(), item.resolve(interpolator, context)?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}
