use serde_json::Value;
use std::fmt;

/// A decrypted credential payload that refuses to be printed.
///
/// `Debug` and `Display` always print `[REDACTED]`.
/// To read the actual payload, use the `expose()` method.
#[derive(Clone, PartialEq)]
pub struct SecretValue(Value);

impl SecretValue {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Access the raw payload
    pub fn expose(&self) -> &Value {
        &self.0
    }

    /// String field of an object payload
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue([REDACTED])")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<Value> for SecretValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secret_value_is_redacted() {
        let secret = SecretValue::new(json!({"token": "t0ps3cret"}));
        assert_eq!(format!("{:?}", secret), "SecretValue([REDACTED])");
        assert_eq!(secret.to_string(), "[REDACTED]");
        assert_eq!(secret.field_str("token"), Some("t0ps3cret"));
    }
}
