//! Source and target terminus descriptors
//!
//! Links are attached with the wire [`Source`](MessageSource) and
//! [`Target`](MessageTarget) types, which convert from any address.

pub use fe2o3_amqp_types::messaging::{Source as MessageSource, Target as MessageTarget};

/// Address of a terminus
pub trait TerminusAddress {
    /// The address, or `""` when the terminus has none
    fn address_str(&self) -> &str;
}

impl TerminusAddress for MessageSource {
    fn address_str(&self) -> &str {
        self.address.as_deref().unwrap_or("")
    }
}

impl TerminusAddress for MessageTarget {
    fn address_str(&self) -> &str {
        self.address.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageSource, MessageTarget, TerminusAddress};

    #[test]
    fn address_converts_into_terminus() {
        assert_eq!(MessageSource::from("inbox").address_str(), "inbox");
        assert_eq!(MessageTarget::from(String::from("q1")).address_str(), "q1");
        assert_eq!(MessageTarget::default().address_str(), "");
    }
}
