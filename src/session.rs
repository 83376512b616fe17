use std::collections::HashMap;

use serde_json::Value;

use crate::error::Error;

/// Variables owned by a single virtual user.
///
/// Seeded when the user is built, overwritten by extraction rules and read
/// when rendering templates. A context is never shared between users.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    vu: usize,
    iteration: u64,
    variables: HashMap<String, String>,
}

impl SessionContext {
    pub fn new(vu: usize) -> Self {
        Self {
            vu,
            iteration: 0,
            variables: HashMap::new(),
        }
    }

    pub fn vu(&self) -> usize {
        self.vu
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn start_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Value of `name`, falling back to the builtin generators.
    pub fn resolve(&self, name: &str) -> Result<String, Error> {
        if let Some(value) = self.variables.get(name) {
            return Ok(value.clone());
        }
        match name {
            "vu" => Ok(self.vu.to_string()),
            "iteration" => Ok(self.iteration.to_string()),
            "uuid" => Ok(uuid::Uuid::new_v4().to_string()),
            "timestamp" => Ok(chrono::Utc::now().timestamp_millis().to_string()),
            _ => Err(Error::new(format!(
                "variable `{name}` is not set for vu {}",
                self.vu
            ))),
        }
    }

    /// Overwrite `variable` with the field at `path` in `body`.
    ///
    /// On any failure the previous value is kept.
    pub fn extract(&mut self, variable: &str, path: &JsonPath, body: &[u8]) -> Result<(), Error> {
        let failure = |reason: String| Error::Extraction {
            variable: variable.to_string(),
            reason,
        };
        let json: Value = serde_json::from_slice(body)
            .map_err(|err| failure(format!("response body is not JSON: {err}")))?;
        let field = path
            .lookup(&json)
            .ok_or_else(|| failure(format!("`{path}` not found in response body")))?;
        let value = match field {
            Value::String(text) => text.clone(),
            Value::Null => return Err(failure(format!("`{path}` is null"))),
            Value::Object(_) | Value::Array(_) => {
                return Err(failure(format!("`{path}` is not a scalar")))
            }
            other => other.to_string(),
        };
        self.variables.insert(variable.to_string(), value);
        Ok(())
    }
}

/// Path into a JSON document, written either as a JSON pointer
/// (`/data/sessionId`) or in dotted form (`data.sessionId`, `items.0.id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    pointer: String,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self, Error> {
        let path = path.trim();
        let path = path.strip_prefix("$.").unwrap_or(path);
        if path.is_empty() || path == "/" {
            return Err(Error::config("empty JSON path"));
        }
        if path.starts_with('/') {
            return Ok(Self {
                pointer: path.to_string(),
            });
        }
        if path.split('.').any(str::is_empty) {
            return Err(Error::config(format!("malformed JSON path `{path}`")));
        }
        let pointer = path
            .split('.')
            .map(|part| part.replace('~', "~0").replace('/', "~1"))
            .fold(String::new(), |mut acc, part| {
                acc.push('/');
                acc.push_str(&part);
                acc
            });
        Ok(Self { pointer })
    }

    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        value.pointer(&self.pointer)
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_and_pointer_paths_agree() {
        assert_eq!(
            JsonPath::parse("data.sessionId").unwrap(),
            JsonPath::parse("/data/sessionId").unwrap()
        );
        assert_eq!(
            JsonPath::parse("$.items.0.id").unwrap().to_string(),
            "/items/0/id"
        );
        assert!(JsonPath::parse("data..id").is_err());
        assert!(JsonPath::parse("").is_err());
    }

    #[test]
    fn successful_extraction_overwrites() {
        let mut session = SessionContext::new(1);
        session.set("sessionId", "client-generated");
        let path = JsonPath::parse("data.sessionId").unwrap();

        session
            .extract("sessionId", &path, br#"{"data":{"sessionId":"server-issued"}}"#)
            .unwrap();

        assert_eq!(session.get("sessionId"), Some("server-issued"));
    }

    #[test]
    fn numbers_are_extracted_as_text() {
        let mut session = SessionContext::new(1);
        let path = JsonPath::parse("data.orderId").unwrap();
        session
            .extract("orderId", &path, br#"{"data":{"orderId":42}}"#)
            .unwrap();
        assert_eq!(session.get("orderId"), Some("42"));
    }

    #[test]
    fn failed_extraction_keeps_previous_value() {
        let mut session = SessionContext::new(1);
        session.set("sessionId", "client-generated");
        let path = JsonPath::parse("data.sessionId").unwrap();

        for body in [
            &b"<html>bad gateway</html>"[..],
            br#"{"data":{}}"#,
            br#"{"data":{"sessionId":null}}"#,
            br#"{"data":{"sessionId":{"nested":true}}}"#,
        ] {
            let err = session.extract("sessionId", &path, body).unwrap_err();
            assert!(matches!(err, Error::Extraction { .. }));
            assert_eq!(session.get("sessionId"), Some("client-generated"));
        }
    }

    #[test]
    fn builtins_resolve_without_declaration() {
        let mut session = SessionContext::new(9);
        session.start_iteration(4);
        assert_eq!(session.resolve("vu").unwrap(), "9");
        assert_eq!(session.resolve("iteration").unwrap(), "4");
        assert_ne!(
            session.resolve("uuid").unwrap(),
            session.resolve("uuid").unwrap()
        );
        assert!(session.resolve("unknown").is_err());
    }
}
