//! Connection profiles and the open extension-option bag.
//!
//! One profile struct serves every backend; backend-specific settings live
//! in [`ExtensionOptions`], an open key/value bag whose lookups accept both
//! camelCase and hyphenated key spellings (`soTimeout` / `so-timeout`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Backend-specific settings carried alongside the common profile fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionOptions {
    values: HashMap<String, Value>,
}

impl ExtensionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a key, accepting camelCase and kebab-case spellings as
    /// synonyms. The literal key wins over either respelling.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(key) {
            return Some(v);
        }
        if let Some(v) = self.values.get(&camel_to_kebab(key)) {
            return Some(v);
        }
        self.values.get(&kebab_to_camel(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// String-array option; a lone string is treated as a one-element list.
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

fn camel_to_kebab(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn kebab_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Connection settings for one connector instance.
///
/// `validate()` must pass before any connection attempt; an absent password
/// normalizes to the empty string and is never `None` afterwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Backend tag (`ftp`, `sftp`, `fdfs`/`fastdfs`, `minio`), resolved by
    /// the factory.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub alias: String,
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "external")]
    pub options: ExtensionOptions,
}

impl ConnectionProfile {
    pub fn new(kind: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: kind.into(),
            alias: String::new(),
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            options: ExtensionOptions::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key, value);
        self
    }

    /// Structural validation; the sole fatal path of the connector
    /// lifecycle. Returns the normalized profile.
    pub fn validate(mut self) -> StoreResult<Self> {
        if self.kind.trim().is_empty() {
            return Err(StoreError::Configuration(
                "profile is missing a backend type".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(StoreError::Configuration(
                "profile is missing a host address".into(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(StoreError::Configuration(
                "profile is missing a username".into(),
            ));
        }
        // Absent password means empty, never null. Serde leaves an
        // explicitly-empty string alone; builders may have skipped it.
        self.host = self.host.trim().to_string();
        self.kind = self.kind.trim().to_string();
        Ok(self)
    }

    /// `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Manual Debug so the password can never leak into diagnostics.
impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("kind", &self.kind)
            .field("alias", &self.alias)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("options", &self.options)
            .finish()
    }
}
