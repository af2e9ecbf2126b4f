//! Display dispatch for kernel output
//!
//! This module turns IOPub messages into rendering actions. Rich results are
//! resolved by a fixed MIME-type priority, streams and errors are formatted as
//! HTML, and everything is delivered through a small [`DisplayCallbacks`] sink.

use std::borrow::Cow;

use base64::Engine;

use crate::ansi::ansi_to_html;
use crate::content::{DisplayContent, ErrorContent, MessageContent, MimeBundle, StreamContent};
use crate::message::JupyterMessage;

/// MIME type whose presence triggers code execution instead of rendering
pub const JAVASCRIPT: &str = "application/javascript";

/// Renderable MIME types, richest first
pub const DISPLAY_PRIORITY: [&str; 8] = [
    "text/html",
    "text/markdown",
    "text/latex",
    "image/svg+xml",
    "image/png",
    "image/jpeg",
    "application/json",
    "text/plain",
];

/// Sinks receiving rendered output
pub trait DisplayCallbacks {
    /// Run JavaScript emitted by the kernel
    fn execute(&mut self, code: &str);
    /// Show an HTML fragment
    fn result(&mut self, html: &str);
    /// Show an HTML-formatted error traceback
    fn trace(&mut self, html: &str);
}

/// Converters for markup the dispatcher cannot render itself
pub trait MarkupRenderer {
    fn markdown(&self, source: &str) -> String;
    fn latex(&self, source: &str) -> String;
}

/// Fallback renderer that shows markup source verbatim in a `<pre>` block
#[derive(Debug, Clone, Copy, Default)]
pub struct PreformattedMarkup;

impl MarkupRenderer for PreformattedMarkup {
    fn markdown(&self, source: &str) -> String {
        format!("<pre class='markdown'>{}</pre>", escape_html(source))
    }

    fn latex(&self, source: &str) -> String {
        format!("<pre class='latex'>{}</pre>", escape_html(source))
    }
}

/// Outcome of resolving a MIME bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedData {
    /// JavaScript to execute
    Execute(String),
    /// HTML produced from the named MIME type
    Html { mime: &'static str, html: String },
}

/// Routes messages to [`DisplayCallbacks`] by `msg_type`
#[derive(Debug, Clone, Default)]
pub struct DisplayDispatch<R = PreformattedMarkup> {
    markup: R,
}

impl<R: MarkupRenderer> DisplayDispatch<R> {
    pub fn new(markup: R) -> Self {
        Self { markup }
    }

    /// Handle one message, invoking at most one callback.
    ///
    /// Malformed content and unknown message types are logged, never raised.
    pub fn handle_message<C>(&self, msg: &JupyterMessage, callbacks: &mut C)
    where
        C: DisplayCallbacks + ?Sized,
    {
        let content = match MessageContent::from_message(msg) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Malformed {} content: {}", msg.msg_type(), e);
                return;
            }
        };

        match content {
            MessageContent::ExecuteResult(display) | MessageContent::DisplayData(display) => {
                self.render_data(&display, callbacks)
            }
            MessageContent::Stream(stream) => callbacks.result(&render_stream(&stream)),
            MessageContent::Status(status) => {
                tracing::info!("Kernel {}", status.execution_state);
            }
            MessageContent::Error(error) => callbacks.trace(&render_error(&error)),
            MessageContent::ExecuteInput(_) => {}
            MessageContent::CommOpen(_) | MessageContent::CommMsg(_) => {
                callbacks.result(&render_unimplemented(msg))
            }
            MessageContent::Unrecognized(msg_type) => {
                tracing::warn!("Unrecognized msg_type {:?}: {}", msg_type, msg.content);
            }
        }
    }

    fn render_data<C>(&self, display: &DisplayContent, callbacks: &mut C)
    where
        C: DisplayCallbacks + ?Sized,
    {
        match self.resolve(&display.data) {
            Some(RenderedData::Execute(code)) => callbacks.execute(&code),
            Some(RenderedData::Html { mime, html }) => {
                tracing::debug!("Rendering {} ({} bytes)", mime, html.len());
                callbacks.result(&html);
            }
            None => {
                let mimes: Vec<&str> = display.data.mime_types().collect();
                tracing::info!("No renderable representation among {:?}", mimes);
            }
        }
    }

    /// Pick the representation to show for a bundle.
    ///
    /// JavaScript always wins; otherwise the first type in [`DISPLAY_PRIORITY`]
    /// present in the bundle is rendered.
    pub fn resolve(&self, bundle: &MimeBundle) -> Option<RenderedData> {
        if let Some(code) = bundle.text(JAVASCRIPT) {
            return Some(RenderedData::Execute(code.into_owned()));
        }

        let (mime, repr) = DISPLAY_PRIORITY
            .iter()
            .find_map(|mime| bundle.text(mime).map(|repr| (*mime, repr)))?;

        let html = match mime {
            "text/html" | "text/plain" => repr.into_owned(),
            "text/markdown" => self.markup.markdown(&repr),
            "text/latex" => self.markup.latex(&repr),
            "image/svg+xml" => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(repr.as_bytes());
                image_tag(mime, &encoded)
            }
            "image/png" | "image/jpeg" => image_tag(mime, repr.trim()),
            "application/json" => render_json(bundle, &repr),
            _ => return None,
        };

        Some(RenderedData::Html { mime, html })
    }
}

fn image_tag(mime: &str, base64_data: &str) -> String {
    format!("<img src='data:{};base64,{}'/>", mime, base64_data)
}

fn render_json(bundle: &MimeBundle, fallback: &Cow<'_, str>) -> String {
    let pretty = bundle
        .get("application/json")
        .and_then(|value| serde_json::to_string_pretty(value).ok())
        .unwrap_or_else(|| fallback.to_string());
    format!("<pre>{}</pre>", escape_html(&pretty))
}

/// Format a `stream` message as a tagged `<pre>` block
pub fn render_stream(stream: &StreamContent) -> String {
    format!(
        "<pre class='stream-{}'>{}</pre>",
        escape_html(&stream.name),
        escape_html(&stream.text)
    )
}

/// Format an `error` traceback as HTML
pub fn render_error(error: &ErrorContent) -> String {
    let traceback = ansi_to_html(&error.traceback.join("\n"));
    format!("<p style='font-family: monospace;'>{}</p>", traceback)
}

/// Placeholder for message types that have no renderer yet
pub fn render_unimplemented(msg: &JupyterMessage) -> String {
    format!(
        "<h1><span style='font-family: monospace'>{}</span> not implemented</h1>\
         <p style='font-family: monospace;'>{}</p>",
        escape_html(msg.msg_type()),
        escape_html(&msg.content.to_string())
    )
}

/// Escape HTML special characters
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Recorder {
        executed: Vec<String>,
        results: Vec<String>,
        traces: Vec<String>,
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.executed.len() + self.results.len() + self.traces.len()
        }
    }

    impl DisplayCallbacks for Recorder {
        fn execute(&mut self, code: &str) {
            self.executed.push(code.to_string());
        }
        fn result(&mut self, html: &str) {
            self.results.push(html.to_string());
        }
        fn trace(&mut self, html: &str) {
            self.traces.push(html.to_string());
        }
    }

    fn dispatch(msg_type: &str, content: Value) -> Recorder {
        let mut recorder = Recorder::default();
        let msg = JupyterMessage::new(msg_type, content, "s", "u");
        DisplayDispatch::<PreformattedMarkup>::default().handle_message(&msg, &mut recorder);
        recorder
    }

    #[test]
    fn test_html_preferred_over_plain() {
        let rec = dispatch(
            "execute_result",
            json!({"data": {"text/plain": "x", "text/html": "<b>x</b>"}, "execution_count": 1}),
        );
        assert_eq!(rec.results, vec!["<b>x</b>"]);
    }

    #[test]
    fn test_javascript_takes_priority() {
        let rec = dispatch(
            "display_data",
            json!({"data": {"application/javascript": "1+1", "text/html": "<b>x</b>", "text/plain": "x"}}),
        );
        assert_eq!(rec.executed, vec!["1+1"]);
        assert!(rec.results.is_empty());
    }

    #[test]
    fn test_priority_order() {
        let dispatch = DisplayDispatch::new(PreformattedMarkup);
        let bundle = |value: Value| -> MimeBundle { serde_json::from_value(value).unwrap() };

        let rendered = dispatch
            .resolve(&bundle(json!({"text/plain": "p", "text/markdown": "# h"})))
            .unwrap();
        assert_eq!(
            rendered,
            RenderedData::Html {
                mime: "text/markdown",
                html: "<pre class='markdown'># h</pre>".into()
            }
        );

        let rendered = dispatch
            .resolve(&bundle(json!({"image/jpeg": "JPG", "image/png": "PNG"})))
            .unwrap();
        assert_eq!(
            rendered,
            RenderedData::Html {
                mime: "image/png",
                html: "<img src='data:image/png;base64,PNG'/>".into()
            }
        );

        assert!(dispatch
            .resolve(&bundle(json!({"application/vnd.custom": {}})))
            .is_none());
    }

    #[test]
    fn test_svg_is_base64_encoded() {
        let dispatch = DisplayDispatch::new(PreformattedMarkup);
        let bundle: MimeBundle = serde_json::from_value(json!({"image/svg+xml": "<svg/>"})).unwrap();
        match dispatch.resolve(&bundle) {
            Some(RenderedData::Html { html, .. }) => {
                assert_eq!(html, "<img src='data:image/svg+xml;base64,PHN2Zy8+'/>");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_json_is_pretty_printed() {
        let rec = dispatch("display_data", json!({"data": {"application/json": {"a": [1]}}}));
        assert_eq!(
            rec.results,
            vec!["<pre>{\n  &quot;a&quot;: [\n    1\n  ]\n}</pre>"]
        );
    }

    #[test]
    fn test_markup_renderer_is_used() {
        struct Upper;
        impl MarkupRenderer for Upper {
            fn markdown(&self, source: &str) -> String {
                source.to_uppercase()
            }
            fn latex(&self, source: &str) -> String {
                format!("<math>{}</math>", source)
            }
        }

        let mut rec = Recorder::default();
        let msg = JupyterMessage::new(
            "display_data",
            json!({"data": {"text/latex": "x^2"}}),
            "s",
            "u",
        );
        DisplayDispatch::new(Upper).handle_message(&msg, &mut rec);
        assert_eq!(rec.results, vec!["<math>x^2</math>"]);
    }

    #[test]
    fn test_empty_bundle_invokes_nothing() {
        let rec = dispatch("display_data", json!({"data": {}}));
        assert_eq!(rec.calls(), 0);
    }

    #[test]
    fn test_stream_formatting() {
        let rec = dispatch("stream", json!({"name": "stdout", "text": "hi"}));
        assert_eq!(rec.results.len(), 1);
        assert!(rec.results[0].contains("class='stream-stdout'"));
        assert!(rec.results[0].contains("hi"));
    }

    #[test]
    fn test_error_traceback_to_trace() {
        let rec = dispatch(
            "error",
            json!({"ename": "E", "evalue": "v", "traceback": ["\u{1b}[31mE\u{1b}[0m", "line 2"]}),
        );
        assert!(rec.results.is_empty());
        assert_eq!(rec.traces.len(), 1);
        let trace = &rec.traces[0];
        assert!(trace.starts_with("<p style='font-family: monospace;'><span"), "{}", trace);
        assert!(trace.ends_with("<br/>line 2</p>"), "{}", trace);
        assert!(!trace.contains('\u{1b}'));
    }

    #[test]
    fn test_status_and_execute_input_are_silent() {
        assert_eq!(dispatch("status", json!({"execution_state": "busy"})).calls(), 0);
        assert_eq!(
            dispatch("execute_input", json!({"code": "1", "execution_count": 1})).calls(),
            0
        );
    }

    #[test]
    fn test_comm_messages_render_placeholder() {
        let rec = dispatch("comm_open", json!({"comm_id": "c1"}));
        assert_eq!(rec.results.len(), 1);
        assert!(rec.results[0].contains("comm_open</span> not implemented"));
        assert!(rec.results[0].contains("comm_id"));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(dispatch("frobnicate", json!({"x": 1})).calls(), 0);
    }

    #[test]
    fn test_malformed_content_is_ignored() {
        assert_eq!(dispatch("stream", json!({"text": 5})).calls(), 0);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            escape_html("<script>alert('xss')</script>"),
            "&lt;script&gt;alert(&#x27;xss&#x27;)&lt;/script&gt;"
        );
    }
}
