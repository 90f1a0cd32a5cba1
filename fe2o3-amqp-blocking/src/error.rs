//! AMQP error object carried by protocol level failures

use std::fmt;

use fe2o3_amqp_types::definitions::{self, ErrorCondition, Fields};
use serde_amqp::{primitives::Symbol, value::Value};

/// An AMQP error: condition, optional description and optional info map
///
/// This is attached to the result of any operation that fails because of the peer
/// or the transport, and is passed along when a connection, session or link is
/// closed with an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpError {
    /// A symbolic value indicating the error condition
    pub condition: ErrorCondition,

    /// Descriptive text about the error condition
    pub description: Option<String>,

    /// Map carrying information about the error condition
    pub info: Option<Fields>,
}

impl AmqpError {
    /// Creates a new error
    pub fn new(condition: impl Into<ErrorCondition>, description: impl Into<Option<String>>) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
            info: None,
        }
    }

    /// Creates a new error from a condition symbol such as `"amqp:link:detach-forced"`
    ///
    /// Well-known conditions are mapped onto the typed [`ErrorCondition`] variants,
    /// anything else is kept as [`ErrorCondition::Custom`].
    pub fn from_symbol(condition: impl Into<String>, description: impl Into<Option<String>>) -> Self {
        let condition = condition.into();
        let condition = serde_amqp::from_value(Value::Symbol(Symbol::from(condition.as_str())))
            .unwrap_or_else(|_| ErrorCondition::Custom(Symbol::from(condition)));
        Self {
            condition,
            description: description.into(),
            info: None,
        }
    }

    /// Attaches an info map
    pub fn with_info(mut self, info: impl Into<Option<Fields>>) -> Self {
        self.info = info.into();
        self
    }

    /// The condition as it appears on the wire
    pub fn condition_symbol(&self) -> Symbol {
        condition_symbol(&self.condition)
    }

    pub(crate) fn illegal_state(description: impl Into<String>) -> Self {
        Self::new(definitions::AmqpError::IllegalState, Some(description.into()))
    }

    pub(crate) fn detach_forced(description: impl Into<String>) -> Self {
        Self::new(definitions::LinkError::DetachForced, Some(description.into()))
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition_symbol().as_str(), description),
            None => write!(f, "{}", self.condition_symbol().as_str()),
        }
    }
}

impl std::error::Error for AmqpError {}

impl From<definitions::Error> for AmqpError {
    fn from(error: definitions::Error) -> Self {
        Self {
            condition: error.condition,
            description: error.description,
            info: error.info,
        }
    }
}

impl From<AmqpError> for definitions::Error {
    fn from(error: AmqpError) -> Self {
        definitions::Error::new(error.condition, error.description, error.info)
    }
}

/// Symbol of an error condition
pub fn condition_symbol(condition: &ErrorCondition) -> Symbol {
    match serde_amqp::to_value(condition) {
        Ok(Value::Symbol(symbol)) => symbol,
        _ => match condition {
            ErrorCondition::Custom(symbol) => symbol.clone(),
            _ => Symbol::from("amqp:internal-error"),
        },
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{ErrorCondition, LinkError};
    use serde_amqp::primitives::Symbol;

    use super::AmqpError;

    #[test]
    fn known_symbol_maps_to_typed_condition() {
        let error = AmqpError::from_symbol("amqp:link:detach-forced", None);
        assert_eq!(error.condition_symbol().as_str(), "amqp:link:detach-forced");
        assert_eq!(error, AmqpError::new(LinkError::DetachForced, None));
    }

    #[test]
    fn unknown_symbol_is_custom() {
        let error = AmqpError::from_symbol("com.example:oops", Some("bad".to_string()));
        assert_eq!(
            error.condition,
            ErrorCondition::Custom(Symbol::from("com.example:oops"))
        );
        assert_eq!(error.to_string(), "com.example:oops: bad");
    }

    #[test]
    fn converts_to_and_from_the_wire_error() {
        let error = AmqpError::detach_forced("gone").with_info(None);
        let wire = fe2o3_amqp_types::definitions::Error::from(error.clone());
        assert_eq!(wire.description.as_deref(), Some("gone"));
        assert_eq!(AmqpError::from(wire), error);
    }

    #[test]
    fn display_includes_condition_and_description() {
        let error = AmqpError::detach_forced("peer went away");
        assert_eq!(error.to_string(), "amqp:link:detach-forced: peer went away");
    }
}
