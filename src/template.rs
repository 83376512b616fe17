//! `${name}` templates used in step paths, headers and bodies.
//!
//! A template is parsed once when the configuration is loaded. Every
//! variable reference is known up front, which lets a scenario be checked
//! for unresolvable names before any user starts.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::{error::Error, session::SessionContext};

/// Variables that are always available without being declared.
pub const BUILTINS: [&str; 4] = ["vu", "iteration", "uuid", "timestamp"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(Error::config(format!(
                    "unterminated variable reference in `{source}`"
                )));
            };
            let name = after[..end].trim();
            if name.is_empty() {
                return Err(Error::config(format!("empty variable name in `{source}`")));
            }
            segments.push(Segment::Variable(name.to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn is_static(&self) -> bool {
        self.variables().next().is_none()
    }

    pub fn render(&self, session: &SessionContext) -> Result<String, Error> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => out.push_str(&session.resolve(name)?),
            }
        }
        Ok(out)
    }
}

/// JSON body whose string leaves are templates. Keys are never templated.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyTemplate {
    Template(Template),
    Array(Vec<BodyTemplate>),
    Object(Vec<(String, BodyTemplate)>),
    Value(Value),
}

impl BodyTemplate {
    pub fn parse(value: &Value) -> Result<Self, Error> {
        Ok(match value {
            Value::String(text) => {
                let template = Template::parse(text)?;
                if template.is_static() {
                    BodyTemplate::Value(value.clone())
                } else {
                    BodyTemplate::Template(template)
                }
            }
            Value::Array(items) => BodyTemplate::Array(
                items
                    .iter()
                    .map(BodyTemplate::parse)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => BodyTemplate::Object(
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), BodyTemplate::parse(value)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            other => BodyTemplate::Value(other.clone()),
        })
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            BodyTemplate::Template(template) => names.extend(template.variables()),
            BodyTemplate::Array(items) => items.iter().for_each(|x| x.collect_variables(names)),
            BodyTemplate::Object(fields) => fields
                .iter()
                .for_each(|(_, x)| x.collect_variables(names)),
            BodyTemplate::Value(_) => (),
        }
    }

    pub fn render(&self, session: &SessionContext) -> Result<Value, Error> {
        Ok(match self {
            BodyTemplate::Template(template) => Value::String(template.render(session)?),
            BodyTemplate::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.render(session))
                    .collect::<Result<_, _>>()?,
            ),
            BodyTemplate::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key.clone(), value.render(session)?);
                }
                Value::Object(map)
            }
            BodyTemplate::Value(value) => value.clone(),
        })
    }
}
