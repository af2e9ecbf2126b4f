//! Typed message content
//!
//! Content arrives as an untyped JSON object whose shape depends on the
//! header's `msg_type`. [`MessageContent::from_message`] parses it into the
//! matching variant so that consumers work with known fields.

use std::borrow::Cow;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::message::JupyterMessage;

/// Content of a message, keyed by `msg_type`
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    ExecuteResult(DisplayContent),
    DisplayData(DisplayContent),
    Stream(StreamContent),
    Status(StatusContent),
    Error(ErrorContent),
    ExecuteInput(ExecuteInputContent),
    CommOpen(Value),
    CommMsg(Value),
    /// A `msg_type` this client does not interpret
    Unrecognized(String),
}

impl MessageContent {
    /// Parse the content of `msg` according to its `msg_type`
    pub fn from_message(msg: &JupyterMessage) -> Result<Self, serde_json::Error> {
        let content = &msg.content;
        let parsed = match msg.msg_type() {
            "execute_result" => Self::ExecuteResult(DisplayContent::deserialize(content)?),
            "display_data" => Self::DisplayData(DisplayContent::deserialize(content)?),
            "stream" => Self::Stream(StreamContent::deserialize(content)?),
            "status" => Self::Status(StatusContent::deserialize(content)?),
            "error" => Self::Error(ErrorContent::deserialize(content)?),
            "execute_input" => Self::ExecuteInput(ExecuteInputContent::deserialize(content)?),
            "comm_open" => Self::CommOpen(content.clone()),
            "comm_msg" => Self::CommMsg(content.clone()),
            other => Self::Unrecognized(other.to_string()),
        };
        Ok(parsed)
    }
}

/// Content of `execute_result` and `display_data`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DisplayContent {
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Value,
    /// Only present on `execute_result`
    #[serde(default)]
    pub execution_count: Option<u64>,
}

/// Content of `stream`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamContent {
    /// `stdout` or `stderr`
    pub name: String,
    pub text: String,
}

/// Content of `status`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusContent {
    /// `starting`, `busy` or `idle`
    pub execution_state: String,
}

/// Content of `error`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorContent {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    /// ANSI-coloured traceback lines
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Content of `execute_input`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecuteInputContent {
    pub code: String,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

/// A MIME bundle: media type to representation.
///
/// Binary types (`image/png`, `image/jpeg`) carry base64 text. Key order is
/// not meaningful.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MimeBundle(Map<String, Value>);

impl MimeBundle {
    pub fn new(entries: Map<String, Value>) -> Self {
        Self(entries)
    }

    /// The raw representation for `mime`, if present
    pub fn get(&self, mime: &str) -> Option<&Value> {
        self.0.get(mime)
    }

    /// The representation for `mime` as text.
    ///
    /// Strings are returned as-is and arrays of strings (the notebook
    /// multi-line form) are concatenated. Anything else is serialized JSON.
    pub fn text(&self, mime: &str) -> Option<Cow<'_, str>> {
        self.get(mime).map(|value| match value {
            Value::String(s) => Cow::Borrowed(s.as_str()),
            Value::Array(lines) if lines.iter().all(Value::is_string) => {
                Cow::Owned(lines.iter().filter_map(Value::as_str).collect())
            }
            other => Cow::Owned(other.to_string()),
        })
    }

    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(msg_type: &str, content: Value) -> JupyterMessage {
        JupyterMessage::new(msg_type, content, "s", "u")
    }

    #[test]
    fn test_stream_content() {
        let msg = message("stream", json!({"name": "stdout", "text": "hi\n"}));
        assert_eq!(
            MessageContent::from_message(&msg).unwrap(),
            MessageContent::Stream(StreamContent {
                name: "stdout".into(),
                text: "hi\n".into()
            })
        );
    }

    #[test]
    fn test_display_content_defaults() {
        let msg = message("display_data", json!({}));
        match MessageContent::from_message(&msg).unwrap() {
            MessageContent::DisplayData(display) => {
                assert!(display.data.is_empty());
                assert_eq!(display.execution_count, None);
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_malformed_content_is_an_error() {
        let msg = message("stream", json!({"name": 3}));
        assert!(MessageContent::from_message(&msg).is_err());
    }

    #[test]
    fn test_unrecognized_type() {
        let msg = message("frobnicate", json!({"anything": true}));
        assert_eq!(
            MessageContent::from_message(&msg).unwrap(),
            MessageContent::Unrecognized("frobnicate".into())
        );
    }

    #[test]
    fn test_mime_bundle_text_forms() {
        let bundle: MimeBundle = serde_json::from_value(json!({
            "text/plain": "x",
            "text/html": ["<b>", "x", "</b>"],
            "application/json": {"a": 1}
        }))
        .unwrap();

        assert_eq!(bundle.text("text/plain").unwrap(), "x");
        assert_eq!(bundle.text("text/html").unwrap(), "<b>x</b>");
        assert_eq!(bundle.text("application/json").unwrap(), r#"{"a":1}"#);
        assert!(bundle.text("image/png").is_none());
    }
}
