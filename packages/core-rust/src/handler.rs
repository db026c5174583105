//! Operation identity: `{interface, operation}`.
//!
//! # Wire format
//!
//! Handlers serialize to the string `"Interface::Operation"`. Exactly one
//! `::` separator is allowed and neither side may be empty.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SEPARATOR: &str = "::";

/// Address of a logical operation, used as a dispatch key and as ambient
/// request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handler {
    pub interface: String,
    pub operation: String,
}

/// The handler string was not of the form `"Interface::Operation"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid handler {input:?}: expected \"Interface::Operation\"")]
pub struct HandlerFormatError {
    pub input: String,
}

impl Handler {
    #[must_use]
    pub fn new(interface: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.interface, self.operation)
    }
}

impl FromStr for Handler {
    type Err = HandlerFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(interface), Some(operation), None)
                if !interface.is_empty() && !operation.is_empty() =>
            {
                Ok(Self::new(interface, operation))
            }
            _ => Err(HandlerFormatError {
                input: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Handler {
    type Error = HandlerFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Handler> for String {
    fn from(h: Handler) -> Self {
        h.to_string()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_interface_and_operation() {
        let h: Handler = "Greeter::SayHello".parse().unwrap();
        assert_eq!(h.interface, "Greeter");
        assert_eq!(h.operation, "SayHello");
        assert_eq!(h.to_string(), "Greeter::SayHello");
    }

    #[test]
    fn rejects_missing_or_extra_separators() {
        assert!("Greeter".parse::<Handler>().is_err());
        assert!("a::b::c".parse::<Handler>().is_err());
        assert!("::op".parse::<Handler>().is_err());
        assert!("iface::".parse::<Handler>().is_err());
    }

    #[test]
    fn deserializes_from_string() {
        let h: Handler = serde_json::from_str("\"users.v1.Users::getUser\"").unwrap();
        assert_eq!(h, Handler::new("users.v1.Users", "getUser"));
        assert!(serde_json::from_str::<Handler>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn display_parses_back(iface in "[A-Za-z][A-Za-z0-9_.]{0,16}", op in "[A-Za-z][A-Za-z0-9_]{0,16}") {
            let h = Handler::new(iface, op);
            let parsed: Handler = h.to_string().parse().unwrap();
            prop_assert_eq!(parsed, h);
        }
    }
}
