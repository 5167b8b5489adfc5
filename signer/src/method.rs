// ABOUTME: Closed set of NIP-46 methods with parameter extraction
// ABOUTME: Adding a method means adding a variant; dispatch stays exhaustive

use crate::error::{SignerError, SignerResult};
use serde_json::Value;

/// One parsed NIP-46 call. `Nip04` keeps the verb only so the backend
/// can name it in the deprecation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Connect {
        target: String,
        secret: Option<String>,
    },
    GetPublicKey,
    SignEvent {
        event_json: String,
    },
    Nip44Encrypt {
        peer: String,
        plaintext: String,
    },
    Nip44Decrypt {
        peer: String,
        payload: String,
    },
    Ping,
    Nip04 {
        verb: String,
    },
}

impl Method {
    pub fn parse(method: &str, params: &Value) -> SignerResult<Self> {
        let str_param = |idx: usize, name: &'static str| -> SignerResult<String> {
            params
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(SignerError::MissingParameter(name))
        };

        match method {
            "connect" => Ok(Method::Connect {
                target: str_param(0, "target_pubkey")?,
                secret: params.get(1).and_then(Value::as_str).map(str::to_string),
            }),
            "get_public_key" => Ok(Method::GetPublicKey),
            "sign_event" => Ok(Method::SignEvent {
                event_json: str_param(0, "event")?,
            }),
            "nip44_encrypt" => Ok(Method::Nip44Encrypt {
                peer: str_param(0, "pubkey")?,
                plaintext: str_param(1, "plaintext")?,
            }),
            "nip44_decrypt" => Ok(Method::Nip44Decrypt {
                peer: str_param(0, "pubkey")?,
                payload: str_param(1, "ciphertext")?,
            }),
            "ping" => Ok(Method::Ping),
            verb if verb.starts_with("nip04_") => Ok(Method::Nip04 {
                verb: verb.to_string(),
            }),
            other => Err(SignerError::invalid_request(format!(
                "Unsupported method: {}",
                other
            ))),
        }
    }

    /// The wire name, as the ACL evaluator and audit rows see it.
    pub fn name(&self) -> &str {
        match self {
            Method::Connect { .. } => "connect",
            Method::GetPublicKey => "get_public_key",
            Method::SignEvent { .. } => "sign_event",
            Method::Nip44Encrypt { .. } => "nip44_encrypt",
            Method::Nip44Decrypt { .. } => "nip44_decrypt",
            Method::Ping => "ping",
            Method::Nip04 { verb } => verb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_connect_with_secret() {
        let m = Method::parse("connect", &json!(["abcd", "s3cret"])).unwrap();
        assert_eq!(
            m,
            Method::Connect {
                target: "abcd".to_string(),
                secret: Some("s3cret".to_string()),
            }
        );
        assert_eq!(m.name(), "connect");
    }

    #[test]
    fn test_parse_connect_without_secret() {
        let m = Method::parse("connect", &json!(["abcd"])).unwrap();
        assert!(matches!(m, Method::Connect { secret: None, .. }));
    }

    #[test]
    fn test_parse_sign_event() {
        let m = Method::parse("sign_event", &json!(["{\"kind\":1}"])).unwrap();
        assert!(matches!(m, Method::SignEvent { .. }));
    }

    #[test]
    fn test_missing_params() {
        let err = Method::parse("nip44_encrypt", &json!(["peer-only"])).unwrap_err();
        assert!(matches!(err, SignerError::MissingParameter("plaintext")));
    }

    #[test]
    fn test_nip04_verbs_are_recognized() {
        let m = Method::parse("nip04_encrypt", &json!(["a", "b"])).unwrap();
        assert_eq!(m.name(), "nip04_encrypt");
    }

    #[test]
    fn test_unknown_method() {
        assert!(Method::parse("frobnicate", &json!([])).is_err());
    }
}
