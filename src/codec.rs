//! Marshalling of request and response payloads.
//!
//! The adapter never sees concrete message types: each RPC method's
//! descriptor supplies the input and output message types, and payloads
//! are [`DynamicMessage`] values encoded either as binary protobuf or as
//! the protobuf JSON mapping, per the negotiated wire format.

use bytes::Bytes;
use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};

use crate::content_type::WireFormat;
use crate::error::ProtocolError;

/// Serializer for one resolved RPC method.
#[derive(Debug, Clone)]
pub struct MethodCodec {
    method: MethodDescriptor,
}

impl MethodCodec {
    /// Build a codec over a resolved method descriptor.
    pub fn new(method: MethodDescriptor) -> Self {
        MethodCodec { method }
    }

    /// The underlying method descriptor.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Deserialize a request payload into the method's input type.
    pub fn decode_request(
        &self,
        wire: WireFormat,
        buf: Bytes,
    ) -> Result<DynamicMessage, ProtocolError> {
        decode(self.method.input(), wire, buf)
    }

    /// Serialize a request message built from the method's input type.
    pub fn encode_request(
        &self,
        wire: WireFormat,
        message: &DynamicMessage,
    ) -> Result<Bytes, ProtocolError> {
        encode(wire, message)
    }

    /// Deserialize a response payload into the method's output type.
    pub fn decode_response(
        &self,
        wire: WireFormat,
        buf: Bytes,
    ) -> Result<DynamicMessage, ProtocolError> {
        decode(self.method.output(), wire, buf)
    }

    /// Serialize a response message built from the method's output type.
    pub fn encode_response(
        &self,
        wire: WireFormat,
        message: &DynamicMessage,
    ) -> Result<Bytes, ProtocolError> {
        encode(wire, message)
    }
}

fn decode(
    descriptor: MessageDescriptor,
    wire: WireFormat,
    buf: Bytes,
) -> Result<DynamicMessage, ProtocolError> {
    match wire {
        WireFormat::Proto => DynamicMessage::decode(descriptor, buf)
            .map_err(|e| ProtocolError::ParseError(e.to_string())),
        WireFormat::Json => {
            let mut deserializer = serde_json::Deserializer::from_slice(&buf);
            let message = DynamicMessage::deserialize(descriptor, &mut deserializer)
                .map_err(|e| ProtocolError::ParseError(e.to_string()))?;
            deserializer
                .end()
                .map_err(|e| ProtocolError::ParseError(e.to_string()))?;
            Ok(message)
        }
    }
}

fn encode(wire: WireFormat, message: &DynamicMessage) -> Result<Bytes, ProtocolError> {
    match wire {
        WireFormat::Proto => Ok(message.encode_to_vec().into()),
        WireFormat::Json => serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::EncodeError(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::echo_service;
    use prost_reflect::Value;

    fn codec() -> MethodCodec {
        let service = echo_service();
        let method = service.methods().next().unwrap();
        MethodCodec::new(method)
    }

    fn request(text: &str) -> DynamicMessage {
        let codec = codec();
        let mut message = DynamicMessage::new(codec.method().input());
        message.set_field_by_name("text", Value::String(text.to_owned()));
        message
    }

    #[test]
    fn proto_round_trip() {
        let codec = codec();
        let message = request("hi there");

        let bytes = codec.encode_request(WireFormat::Proto, &message).unwrap();
        let decoded = codec.decode_request(WireFormat::Proto, bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn json_round_trip() {
        let codec = codec();
        let message = request("hi there");

        let bytes = codec.encode_request(WireFormat::Json, &message).unwrap();
        assert_eq!(&bytes[..], br#"{"text":"hi there"}"#);

        let decoded = codec.decode_request(WireFormat::Json, bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn truncated_proto_is_a_parse_error() {
        let codec = codec();
        // Field 1, length-delimited, claims 10 bytes but carries 2.
        let err = codec
            .decode_request(WireFormat::Proto, Bytes::from_static(b"\x0a\x0ahi"))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ParseError(_)));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let codec = codec();
        let err = codec
            .decode_request(WireFormat::Json, Bytes::from_static(b"{\"text\":"))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ParseError(_)));
    }

    #[test]
    fn trailing_json_garbage_is_a_parse_error() {
        let codec = codec();
        let err = codec
            .decode_request(WireFormat::Json, Bytes::from_static(b"{} trailing"))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ParseError(_)));
    }
}
