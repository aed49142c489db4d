use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use validator::ValidateEmail;

/// Field name → messages, in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FormErrors(BTreeMap<String, Vec<String>>);

impl FormErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    /// First message recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|m| m.first()).map(String::as_str)
    }

    pub fn all(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Submitted form values plus the errors found while checking them.
///
/// Build one per submission; errors only ever accumulate.
#[derive(Debug, Clone, Default)]
pub struct Form {
    values: HashMap<String, Vec<String>>,
    errors: FormErrors,
}

impl Form {
    pub fn new(values: HashMap<String, Vec<String>>) -> Self {
        Self {
            values,
            errors: FormErrors::default(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in pairs {
            values.entry(k.into()).or_default().push(v.into());
        }
        Self::new(values)
    }

    /// First submitted value for `field`, or `""` when absent.
    pub fn get(&self, field: &str) -> &str {
        self.values
            .get(field)
            .and_then(|v| v.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn has(&mut self, field: &str) -> bool {
        if self.get(field).is_empty() {
            self.errors.add(field, "This field cannot be blank");
            return false;
        }
        true
    }

    pub fn required(&mut self, fields: &[&str]) {
        for field in fields {
            if self.get(field).trim().is_empty() {
                self.errors.add(field, "This field cannot be blank");
            }
        }
    }

    pub fn min_length(&mut self, field: &str, length: usize) -> bool {
        if self.get(field).chars().count() < length {
            self.errors
                .add(field, format!("This field must be at least {length} characters long"));
            return false;
        }
        true
    }

    pub fn max_length(&mut self, field: &str, length: usize) -> bool {
        if self.get(field).chars().count() > length {
            self.errors
                .add(field, format!("This field must be at most {length} characters long"));
            return false;
        }
        true
    }

    pub fn is_email(&mut self, field: &str) {
        let value = self.get(field).to_string();
        if !value.validate_email() {
            self.errors.add(field, "Invalid email address");
        }
    }

    /// Record an error found outside the built-in checks.
    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.add(field, message);
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &FormErrors {
        &self.errors
    }

    pub fn into_errors(self) -> FormErrors {
        self.errors
    }
}
