//! Message model and delivery outcomes
//!
//! [`AmqpMessage`] wraps a [`Message`] whose body is a [`Body<Value>`], the body
//! type that can hold any section a peer may send.

use fe2o3_amqp_types::{
    messaging::{
        message::__private::Serializable, AmqpSequence, AmqpValue, ApplicationProperties, Body,
        Data, Header, Message, MessageAnnotations, MessageId, Outcome, Properties,
    },
    primitives::SimpleValue,
};
use serde_amqp::value::Value;
use serde_bytes::ByteBuf;

/// Terminal disposition of a transferred message
pub type DeliveryOutcome = Outcome;

/// Body of an [`AmqpMessage`]
pub type MessageBody = Body<Value>;

/// An AMQP 1.0 message
#[derive(Debug, Clone)]
pub struct AmqpMessage {
    inner: Message<MessageBody>,
}

impl AmqpMessage {
    /// Creates a [`Builder`] for a message
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A message with a single AMQP value as its body
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self::builder().value(value).build()
    }

    /// A message with a single data section as its body
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self::builder().data(data).build()
    }

    /// The header section
    pub fn header(&self) -> Option<&Header> {
        self.inner.header.as_ref()
    }

    /// The immutable properties section
    pub fn properties(&self) -> Option<&Properties> {
        self.inner.properties.as_ref()
    }

    /// The body
    pub fn body(&self) -> &MessageBody {
        &self.inner.body
    }

    /// The body when it is a single AMQP value
    pub fn value(&self) -> Option<&Value> {
        match &self.inner.body {
            Body::Value(AmqpValue(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns the application property `key`
    pub fn application_property(&self, key: &str) -> Option<&SimpleValue> {
        self.inner.application_properties.as_ref()?.0.get(key)
    }

    /// The `message-id` property
    pub fn message_id(&self) -> Option<&MessageId> {
        self.inner.properties.as_ref()?.message_id.as_ref()
    }

    /// The `correlation-id` property
    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.inner.properties.as_ref()?.correlation_id.as_ref()
    }

    /// Size of the message once its sections are encoded
    pub fn encoded_size(&self) -> Result<u64, serde_amqp::Error> {
        serde_amqp::to_vec(&Serializable(&self.inner)).map(|buf| buf.len() as u64)
    }

    /// The wrapped message
    pub fn as_inner(&self) -> &Message<MessageBody> {
        &self.inner
    }

    /// Unwraps the message
    pub fn into_inner(self) -> Message<MessageBody> {
        self.inner
    }
}

impl From<Message<MessageBody>> for AmqpMessage {
    fn from(inner: Message<MessageBody>) -> Self {
        Self { inner }
    }
}

impl From<AmqpMessage> for Message<MessageBody> {
    fn from(message: AmqpMessage) -> Self {
        message.inner
    }
}

/// Builder for [`AmqpMessage`]
///
/// | Section | Default |
/// |---------|---------|
/// | header | `None` |
/// | message annotations | `None` |
/// | properties | `None` |
/// | application properties | `None` |
/// | body | empty |
#[derive(Debug, Clone, Default)]
pub struct Builder {
    header: Option<Header>,
    properties: Option<Properties>,
    message_annotations: Vec<(String, Value)>,
    application_properties: Vec<(String, SimpleValue)>,
    body: Option<MessageBody>,
}

impl Builder {
    /// Sets the header
    pub fn header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    /// Sets the properties
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Adds an application property
    pub fn application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<SimpleValue>,
    ) -> Self {
        self.application_properties.push((key.into(), value.into()));
        self
    }

    /// Adds a message annotation
    pub fn message_annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message_annotations.push((key.into(), value.into()));
        self
    }

    /// Sets a single data section as the body
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.body = Some(Body::from(Data(ByteBuf::from(data.into()))));
        self
    }

    /// Sets an AMQP value as the body
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.body = Some(Body::Value(AmqpValue(value.into())));
        self
    }

    /// Sets an AMQP sequence as the body
    pub fn sequence(mut self, values: Vec<Value>) -> Self {
        self.body = Some(Body::from(AmqpSequence(values)));
        self
    }

    /// Builds the message
    pub fn build(self) -> AmqpMessage {
        let message_annotations = match self.message_annotations.is_empty() {
            true => None,
            false => Some(
                self.message_annotations
                    .iter()
                    .fold(MessageAnnotations::builder(), |builder, (key, value)| {
                        builder.insert(key.as_str(), value.clone())
                    })
                    .build(),
            ),
        };
        let application_properties = match self.application_properties.is_empty() {
            true => None,
            false => Some(
                self.application_properties
                    .into_iter()
                    .fold(ApplicationProperties::builder(), |builder, (key, value)| {
                        builder.insert(key, value)
                    })
                    .build(),
            ),
        };

        AmqpMessage {
            inner: Message {
                header: self.header,
                delivery_annotations: None,
                message_annotations,
                properties: self.properties,
                application_properties,
                body: self.body.unwrap_or(Body::Empty),
                footer: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{
        messaging::{Body, Outcome, Properties, Released},
        primitives::SimpleValue,
    };
    use serde_amqp::value::Value;

    use super::AmqpMessage;

    #[test]
    fn data_section_encoding_is_measured_exactly() {
        // descriptor (3) + vbin32 constructor and length (5) + payload
        let message = AmqpMessage::with_data(vec![0u8; 1000]);
        assert_eq!(message.encoded_size().unwrap(), 1008);
    }

    #[test]
    fn encoded_size_grows_with_payload() {
        let small = AmqpMessage::with_data(vec![0u8; 16]).encoded_size().unwrap();
        let large = AmqpMessage::with_data(vec![0u8; 4096]).encoded_size().unwrap();
        assert!(small > 16);
        assert!(large > 4096);
        assert!(large > small);
    }

    #[test]
    fn application_properties_are_accessible() {
        let message = AmqpMessage::builder()
            .application_property("status-code", 202i32)
            .value("hello")
            .build();
        assert_eq!(
            message.application_property("status-code"),
            Some(&SimpleValue::Int(202))
        );
        assert_eq!(message.value(), Some(&Value::String("hello".into())));
        assert!(message.application_property("missing").is_none());
    }

    #[test]
    fn properties_and_annotations_are_kept() {
        let message = AmqpMessage::builder()
            .properties(Properties::builder().message_id(7u64).build())
            .message_annotation("x-opt-partition-key", "p1")
            .build();
        assert!(message.message_id().is_some());
        assert!(message.as_inner().message_annotations.is_some());
        assert!(matches!(message.body(), Body::Empty));
    }

    #[test]
    fn builder_keeps_the_last_body() {
        let message = AmqpMessage::builder().value(1i32).data(vec![1, 2]).build();
        assert!(matches!(message.body(), Body::Data(_)));
        assert!(message.value().is_none());
    }

    #[test]
    fn outcome_is_the_wire_outcome() {
        let outcome = super::DeliveryOutcome::Released(Released {});
        assert!(matches!(outcome, Outcome::Released(_)));
    }
}
