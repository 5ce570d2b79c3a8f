//! Placeholder template parsing and rendering.
//!
//! Templates interleave literal text with `{{ prefix:name }}` placeholders,
//! optionally piped through functions: `{{ header:device-id | fn:upper() }}`.
//! Parsing is implemented with the `pom` parser combinator library; rendering
//! resolves placeholders against a context derived from the originating
//! signal.
//!
//! Supported prefixes are `thing`, `entity`, `feature`, `header` and `topic`;
//! unknown prefixes or unresolvable names surface at render time, not parse
//! time.

use std::collections::HashMap;

use pom::utf8::{end, list, none_of, one_of, seq, sym, Parser};

use crate::error::Error;
use crate::signal::Signal;

/// A single pipeline function applied to a resolved placeholder value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaceholderFunction {
    /// `fn:upper()` - upper-cases the value.
    Upper,
    /// `fn:lower()` - lower-cases the value.
    Lower,
    /// `fn:default('fallback')` - substitutes the fallback when unresolved.
    Default(String),
}

impl PlaceholderFunction {
    fn apply(&self, value: Option<String>) -> Option<String> {
        match self {
            Self::Upper => value.map(|v| v.to_uppercase()),
            Self::Lower => value.map(|v| v.to_lowercase()),
            Self::Default(fallback) => value.or_else(|| Some(fallback.clone())),
        }
    }

    fn from_call(name: &str, args: Vec<String>) -> Result<Self, Error> {
        match (name, args.as_slice()) {
            ("upper", []) => Ok(Self::Upper),
            ("lower", []) => Ok(Self::Lower),
            ("default", [fallback]) => Ok(Self::Default(fallback.clone())),
            ("upper", _) | ("lower", _) => Err(Error::function_signature(format!(
                "fn:{name} takes no arguments, got {}",
                args.len()
            ))),
            ("default", _) => Err(Error::function_signature(format!(
                "fn:default takes exactly one argument, got {}",
                args.len()
            ))),
            _ => Err(Error::function_signature(format!(
                "unknown function fn:{name}"
            ))),
        }
    }
}

/// A parsed `prefix:name | fn:…` expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceholderExpr {
    pub prefix: String,
    pub name: String,
    pub functions: Vec<PlaceholderFunction>,
}

impl PlaceholderExpr {
    pub fn key(&self) -> String {
        format!("{}:{}", self.prefix, self.name)
    }
}

/// Syntactic form of an expression, before function signatures are checked.
#[derive(Clone, Debug)]
struct RawExpr {
    prefix: String,
    name: String,
    calls: Vec<(String, Vec<String>)>,
}

#[derive(Clone, Debug)]
enum RawSegment {
    Literal(String),
    Placeholder(RawExpr),
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(PlaceholderExpr),
}

/// A parsed template, ready for repeated rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn whitespace<'a>() -> Parser<'a, ()> {
    one_of(" \t").repeat(0..).discard()
}

fn identifier<'a>() -> Parser<'a, &'a str> {
    one_of("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890-_.")
        .repeat(1..)
        .collect()
}

fn function_name<'a>() -> Parser<'a, &'a str> {
    one_of("abcdefghijklmnopqrstuvwxyz").repeat(1..).collect()
}

fn quoted<'a>() -> Parser<'a, String> {
    (sym('\'') * none_of("'").repeat(0..).collect() - sym('\'')).map(|s: &str| s.to_owned())
}

fn function_call<'a>() -> Parser<'a, (String, Vec<String>)> {
    let name = seq("fn:") * function_name().map(str::to_owned);
    let args = sym('(') * whitespace() * list(quoted(), whitespace() * sym(',') * whitespace()).opt()
        - whitespace()
        - sym(')');

    (name + args).map(|(name, args)| (name, args.unwrap_or_default()))
}

fn expression<'a>() -> Parser<'a, RawExpr> {
    let source = (function_name() - sym(':')) + identifier();
    let pipeline = (whitespace() * sym('|') * whitespace() * function_call()).repeat(0..);

    (source + pipeline).map(|((prefix, name), calls)| RawExpr {
        prefix: prefix.to_owned(),
        name: name.to_owned(),
        calls,
    })
}

fn placeholder<'a>() -> Parser<'a, RawSegment> {
    (seq("{{") * whitespace() * expression() - whitespace() - seq("}}"))
        .map(RawSegment::Placeholder)
        .name("placeholder")
}

/// Literal run without any `{`.
fn plain_literal<'a>() -> Parser<'a, RawSegment> {
    none_of("{")
        .repeat(1..)
        .collect()
        .map(|s: &str| RawSegment::Literal(s.to_owned()))
}

/// A single `{` that does not open a placeholder.
fn lone_brace<'a>() -> Parser<'a, RawSegment> {
    (sym('{') + none_of("{")).map(|(_, c)| RawSegment::Literal(format!("{{{c}")))
}

fn template<'a>() -> Parser<'a, Vec<RawSegment>> {
    (placeholder() | plain_literal() | lone_brace()).repeat(0..) - end()
}

impl Template {
    /// Parses a template; unbalanced or malformed placeholders are rejected.
    ///
    /// Function signature errors (wrong arity, unknown function) keep their
    /// specific error type so callers can distinguish them from plain syntax
    /// errors.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let raw = template().parse_str(input).map_err(|e| {
            Error::config_invalid(format!("malformed template {input:?}: {e}"))
        })?;

        let mut segments = Vec::with_capacity(raw.len());
        for segment in raw {
            segments.push(match segment {
                RawSegment::Literal(text) => Segment::Literal(text),
                RawSegment::Placeholder(expr) => {
                    let functions = expr
                        .calls
                        .into_iter()
                        .map(|(name, args)| PlaceholderFunction::from_call(&name, args))
                        .collect::<Result<Vec<_>, _>>()?;
                    Segment::Placeholder(PlaceholderExpr {
                        prefix: expr.prefix,
                        name: expr.name,
                        functions,
                    })
                }
            });
        }

        Ok(Self { segments })
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }

    /// Renders the template against `ctx`.
    ///
    /// An unresolved placeholder without a `fn:default` stage fails the whole
    /// render with [`Error::PlaceholderUnresolved`].
    pub fn render(&self, ctx: &PlaceholderContext) -> Result<String, Error> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(expr) => {
                    let mut value = ctx.resolve(&expr.key()).map(str::to_owned);
                    for function in &expr.functions {
                        value = function.apply(value);
                    }
                    match value {
                        Some(value) => out.push_str(&value),
                        None => return Err(Error::unresolved(expr.key())),
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Resolution context for placeholder rendering.
///
/// Keys are full `prefix:name` pairs; header keys are normalized to lower
/// case.
#[derive(Clone, Debug, Default)]
pub struct PlaceholderContext {
    values: HashMap<String, String>,
}

impl PlaceholderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Builds the rendering context of an outbound signal: entity and thing
    /// ids, feature id, matched headers and the protocol topic.
    pub fn from_signal(signal: &Signal) -> Self {
        let mut ctx = Self::new();

        let entity = signal.entity_id();
        for prefix in ["thing", "entity"] {
            ctx.insert(format!("{prefix}:id"), entity.to_string());
            ctx.insert(format!("{prefix}:namespace"), entity.namespace());
            ctx.insert(format!("{prefix}:name"), entity.name());
        }

        if let Some(feature) = signal.feature_id() {
            ctx.insert("feature:id", feature);
        }

        for (name, value) in signal.headers() {
            ctx.insert(format!("header:{}", name.to_ascii_lowercase()), value);
        }

        let topic = signal.topic();
        ctx.insert("topic:full", topic.to_string());
        ctx.insert("topic:namespace", topic.namespace.clone());
        ctx.insert("topic:entity-name", topic.entity_name.clone());
        ctx.insert("topic:channel", topic.channel.clone());
        ctx.insert("topic:criterion", topic.criterion.clone());
        if let Some(action) = &topic.action {
            ctx.insert("topic:action", action.clone());
            ctx.insert("topic:subject", action.clone());
        }

        ctx
    }
}
