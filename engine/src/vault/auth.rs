//! Applying resolved credentials to outbound requests
//!
//! The credential's strategy decides which payload fields are read and
//! where they end up:
//!
//! | strategy  | payload fields                    | effect                           |
//! |-----------|-----------------------------------|----------------------------------|
//! | `bearer`  | `token` (or `access_token`)       | `Authorization: Bearer <token>`  |
//! | `api_key` | `key`, optional `header`          | `<header>: <key>` (`X-API-Key`)  |
//! | `basic`   | `username`, optional `password`   | HTTP basic auth                  |
//! | `headers` | `headers` object                  | each entry becomes a header      |
//! | `query`   | `params` object                   | each entry becomes a query pair  |

use super::ResolvedCredential;
use sdk::errors::EngineError;
use serde_json::Value;

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Secret request material derived from a credential
#[derive(Default)]
pub struct AuthMaterial {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub basic: Option<(String, Option<String>)>,
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        let query_names: Vec<&str> = self.query.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("AuthMaterial")
            .field("headers", &header_names)
            .field("query", &query_names)
            .field("basic", &self.basic.is_some())
            .finish()
    }
}

fn required<'a>(credential: &'a ResolvedCredential, field: &str) -> Result<&'a str, EngineError> {
    credential.payload.field_str(field).ok_or_else(|| {
        EngineError::RequestExecutionFailed(format!(
            "credential {} has no '{}' field for strategy '{}'",
            credential.id, field, credential.strategy
        ))
    })
}

fn string_pairs(credential: &ResolvedCredential, field: &str) -> Result<Vec<(String, String)>, EngineError> {
    match credential.payload.expose().get(field) {
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()),
        _ => Err(EngineError::RequestExecutionFailed(format!(
            "credential {} has no '{}' object for strategy '{}'",
            credential.id, field, credential.strategy
        ))),
    }
}

/// Derive request material from a resolved credential
pub fn material_for(credential: &ResolvedCredential) -> Result<AuthMaterial, EngineError> {
    let mut material = AuthMaterial::default();

    match credential.strategy.as_str() {
        "bearer" | "oauth2" => {
            let token = credential
                .payload
                .field_str("token")
                .or_else(|| credential.payload.field_str("access_token"))
                .ok_or_else(|| {
                    EngineError::RequestExecutionFailed(format!(
                        "credential {} has no token",
                        credential.id
                    ))
                })?;
            material
                .headers
                .push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        "api_key" => {
            let key = required(credential, "key")?;
            let header = credential
                .payload
                .field_str("header")
                .unwrap_or(DEFAULT_API_KEY_HEADER);
            material.headers.push((header.to_string(), key.to_string()));
        }
        "basic" => {
            let username = required(credential, "username")?;
            let password = credential.payload.field_str("password").map(str::to_string);
            material.basic = Some((username.to_string(), password));
        }
        "headers" => {
            material.headers = string_pairs(credential, "headers")?;
        }
        "query" => {
            material.query = string_pairs(credential, "params")?;
        }
        other => {
            return Err(EngineError::RequestExecutionFailed(format!(
                "unsupported credential strategy '{}'",
                other
            )));
        }
    }

    Ok(material)
}
