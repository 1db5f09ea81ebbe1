//! Structured faults returned by the RPC interface.

use std::fmt;
use serde::{Deserialize, Serialize};
use crate::constants::FAULT_CODE_PREFIX;


//------------ Fault ---------------------------------------------------------

/// A failed RPC operation as seen by the caller.
///
/// The `fault_code` is meant for programs to branch on, the `fault_string`
/// for humans and logs. The optional `translation_code` is a key into the
/// localised messages of a user interface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Fault {
    pub fault_code: String,
    pub fault_string: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_code: Option<String>,
}

impl Fault {
    /// Creates a fault for the given kind, e.g. `"TokenNotActive"`.
    pub fn new(kind: &str, fault_string: impl fmt::Display) -> Self {
        Fault {
            fault_code: format!("{FAULT_CODE_PREFIX}.{kind}"),
            fault_string: fault_string.to_string(),
            translation_code: None,
        }
    }

    pub fn with_translation_code(mut self, code: impl Into<String>) -> Self {
        self.translation_code = Some(code.into());
        self
    }

    /// Returns the fault kind without the prefix.
    pub fn kind(&self) -> &str {
        self.fault_code
            .strip_prefix(FAULT_CODE_PREFIX)
            .and_then(|code| code.strip_prefix('.'))
            .unwrap_or(&self.fault_code)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == kind
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.fault_code, self.fault_string)
    }
}

impl std::error::Error for Fault { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_is_prefixed() {
        let fault = Fault::new("TokenNotActive", "token '1' is not active")
            .with_translation_code("token_not_active");
        assert_eq!(fault.fault_code, "Signer.TokenNotActive");
        assert_eq!(fault.kind(), "TokenNotActive");
        assert!(fault.is_kind("TokenNotActive"));

        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["translation_code"], "token_not_active");
    }

    #[test]
    fn translation_code_is_optional() {
        let fault: Fault = serde_json::from_str(
            r#"{"fault_code":"Signer.Internal","fault_string":"oops"}"#
        ).unwrap();
        assert_eq!(fault.translation_code, None);
        assert_eq!(fault.to_string(), "Signer.Internal: oops");
    }
}
