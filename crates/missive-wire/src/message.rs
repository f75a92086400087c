//! Message data model.
//!
//! A message belongs to a named correspondence and is either a payload frame
//! (`data`), a terminating success frame (`fin`), or a terminating failure
//! frame (`err`). The initiating frame of a correspondence carries no `type`
//! field at all; on every other frame an absent `type` means `data`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frame type tag as it appears on the wire.
///
/// The absence of the tag is meaningful and therefore not a variant here:
/// `Message::kind` is an `Option<MessageKind>`, omitted from the encoding
/// when `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Intermediate payload frame.
    #[serde(rename = "data")]
    Data,
    /// Terminating success frame, optionally carrying a final body.
    #[serde(rename = "fin")]
    Finish,
    /// Terminating failure frame carrying a [`MessageError`].
    #[serde(rename = "err")]
    Error,
}

/// Message header.
///
/// `correspondence_id` and `subject` are required on every frame. Any
/// additional string-keyed fields a peer sends are preserved in `rest` and
/// round-trip through encode/decode untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Identifies the correspondence this frame belongs to. Generated by the
    /// initiator; unique within the stream's active set; opaque to receivers.
    #[serde(rename = "correspondenceId")]
    pub correspondence_id: String,
    /// Routing key, analogous to a URL path.
    pub subject: String,
    /// Opaque authorization string. The protocol carries it; it never
    /// interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    /// Additional header fields, preserved verbatim.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Header {
    /// Header for a new correspondence. The correspondence id is left empty;
    /// the peer fills in a generated one on `send`.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            correspondence_id: String::new(),
            subject: subject.into(),
            authorization: None,
            rest: Map::new(),
        }
    }

    /// Header with an explicit correspondence id.
    pub fn with_id(correspondence_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            correspondence_id: correspondence_id.into(),
            subject: subject.into(),
            authorization: None,
            rest: Map::new(),
        }
    }

    /// Attach an authorization string.
    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }
}

/// Error payload of an `err` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    /// Short machine-readable tag, e.g. `"UnknownSubject"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl MessageError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MessageError {}

/// One protocol frame.
///
/// Field presence mirrors the wire format: absent fields are omitted, never
/// encoded as nulls. Key order in the encoding is not significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    /// Frame type. `None` on the wire means `data` for receivers; the
    /// initiating frame of a correspondence is conventionally sent without it.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    /// Payload. Any JSON value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Present exactly when `kind` is [`MessageKind::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl Message {
    /// The initiating frame of a new correspondence (no type tag).
    pub fn initiate(header: Header, body: Option<Value>) -> Self {
        Self {
            header,
            kind: None,
            body,
            error: None,
        }
    }

    /// An intermediate payload frame.
    pub fn data(header: Header, body: Value) -> Self {
        Self {
            header,
            kind: Some(MessageKind::Data),
            body: Some(body),
            error: None,
        }
    }

    /// A terminating success frame, optionally carrying a final body.
    pub fn finish(header: Header, body: Option<Value>) -> Self {
        Self {
            header,
            kind: Some(MessageKind::Finish),
            body,
            error: None,
        }
    }

    /// A terminating failure frame.
    pub fn error(header: Header, error: MessageError) -> Self {
        Self {
            header,
            kind: Some(MessageKind::Error),
            body: None,
            error: Some(error),
        }
    }

    /// Effective frame type: an absent tag is read as `data`.
    pub fn kind_or_data(&self) -> MessageKind {
        self.kind.unwrap_or(MessageKind::Data)
    }

    /// Check the schema invariants that the type system cannot express.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.header.correspondence_id.is_empty() {
            return Err(SchemaError::EmptyCorrespondenceId);
        }
        if self.header.subject.is_empty() {
            return Err(SchemaError::EmptySubject);
        }
        match (self.kind_or_data(), &self.error) {
            (MessageKind::Error, None) => return Err(SchemaError::MissingError),
            (MessageKind::Error, Some(error)) => {
                if error.kind.is_empty() {
                    return Err(SchemaError::EmptyErrorKind);
                }
                if error.message.is_empty() {
                    return Err(SchemaError::EmptyErrorMessage);
                }
            }
            (_, Some(_)) => return Err(SchemaError::UnexpectedError),
            (_, None) => {}
        }
        Ok(())
    }
}

/// A well-formed JSON value that violates the message schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaError {
    EmptyCorrespondenceId,
    EmptySubject,
    /// `err` frame without an `error` field.
    MissingError,
    /// `error` field on a non-`err` frame.
    UnexpectedError,
    EmptyErrorKind,
    EmptyErrorMessage,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::EmptyCorrespondenceId => write!(f, "header.correspondenceId is missing or empty"),
            SchemaError::EmptySubject => write!(f, "header.subject is missing or empty"),
            SchemaError::MissingError => write!(f, "err frame without an error field"),
            SchemaError::UnexpectedError => write!(f, "error field on a non-err frame"),
            SchemaError::EmptyErrorKind => write!(f, "error.type is empty"),
            SchemaError::EmptyErrorMessage => write!(f, "error.message is empty"),
        }
    }
}

impl std::error::Error for SchemaError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tags_match_wire_codes() {
        assert_eq!(serde_json::to_string(&MessageKind::Data).unwrap(), r#""data""#);
        assert_eq!(serde_json::to_string(&MessageKind::Finish).unwrap(), r#""fin""#);
        assert_eq!(serde_json::to_string(&MessageKind::Error).unwrap(), r#""err""#);
    }

    #[test]
    fn absent_kind_reads_as_data() {
        let msg = Message::initiate(Header::with_id("c1", "login"), Some(json!({"user": "foo"})));
        assert_eq!(msg.kind, None);
        assert_eq!(msg.kind_or_data(), MessageKind::Data);
    }

    #[test]
    fn extra_header_fields_are_preserved() {
        let line = r#"{"header":{"correspondenceId":"c1","subject":"s","trace":"t-42"},"body":1}"#;
        let msg: Message = serde_json::from_str(line).unwrap();
        assert_eq!(msg.header.rest.get("trace"), Some(&json!("t-42")));

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["header"]["trace"], json!("t-42"));
    }

    #[test]
    fn validate_rejects_empty_required_fields() {
        let msg = Message::initiate(Header::new("s"), None);
        assert_eq!(msg.validate(), Err(SchemaError::EmptyCorrespondenceId));

        let msg = Message::initiate(Header::with_id("c1", ""), None);
        assert_eq!(msg.validate(), Err(SchemaError::EmptySubject));
    }

    #[test]
    fn validate_ties_error_field_to_err_frames() {
        let header = Header::with_id("c1", "s");

        let mut msg = Message::data(header.clone(), json!(1));
        msg.error = Some(MessageError::new("X", "y"));
        assert_eq!(msg.validate(), Err(SchemaError::UnexpectedError));

        let mut msg = Message::error(header.clone(), MessageError::new("X", "y"));
        msg.error = None;
        assert_eq!(msg.validate(), Err(SchemaError::MissingError));

        let msg = Message::error(header.clone(), MessageError::new("", "y"));
        assert_eq!(msg.validate(), Err(SchemaError::EmptyErrorKind));

        let msg = Message::error(header, MessageError::new("X", ""));
        assert_eq!(msg.validate(), Err(SchemaError::EmptyErrorMessage));
    }

    #[test]
    fn unknown_kind_tag_fails_to_parse() {
        let line = r#"{"header":{"correspondenceId":"c1","subject":"s"},"type":"nope"}"#;
        assert!(serde_json::from_str::<Message>(line).is_err());
    }
}
