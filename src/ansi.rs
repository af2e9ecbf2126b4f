//! ANSI escape sequences to HTML
//!
//! Kernel tracebacks are coloured with SGR escape codes. Conversion to styled
//! `<span>`s is done by the `ansi-to-html` crate, which also escapes the text.
//! Newlines become `<br/>` so the traceback keeps its shape inside a `<p>`.

use crate::display::escape_html;

const ESC: char = '\x1b';

/// Convert ANSI-coloured text to HTML
pub fn ansi_to_html(text: &str) -> String {
    let html = match ansi_to_html::convert(text) {
        Ok(html) => html,
        Err(e) => {
            tracing::warn!("Could not convert ANSI traceback, showing it uncoloured: {}", e);
            escape_html(text)
        }
    };

    // Escapes the converter leaves behind (unterminated or unsupported
    // sequences) would otherwise reach the page as raw control characters.
    html.replace(ESC, "")
        .replace("\r\n", "\n")
        .replace('\r', "")
        .replace('\n', "<br/>")
}
