//! Buffer rendering for streamed messages.
//!
//! Buffers are re-rendered whole after every delta. They are short-lived
//! and only ever grow, so diffing would buy nothing.

use pulldown_cmark::{html, Event, Options, Parser};
use serde::Serialize;

/// Rendered form of a text buffer (HTML for the default renderer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Rendered(String);

impl Rendered {
    pub fn new(markup: impl Into<String>) -> Self {
        Self(markup.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Pure function from a text buffer to its rendered form.
///
/// Implementations must not panic on any input, including partial markup
/// cut off mid-token.
pub trait Render {
    fn render(&self, source: &str) -> Rendered;
}

impl<F> Render for F
where
    F: Fn(&str) -> Rendered,
{
    fn render(&self, source: &str) -> Rendered {
        self(source)
    }
}

/// CommonMark to HTML.
///
/// Raw HTML in the source is escaped and shown as text.
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    options: Options,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self {
            options: Options::ENABLE_TABLES
                | Options::ENABLE_STRIKETHROUGH
                | Options::ENABLE_TASKLISTS,
        }
    }
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Render for MarkdownRenderer {
    fn render(&self, source: &str) -> Rendered {
        let parser = Parser::new_ext(source, self.options).map(|event| match event {
            Event::Html(raw) => Event::Text(raw),
            other => other,
        });

        let mut out = String::with_capacity(source.len() + source.len() / 2);
        html::push_html(&mut out, parser);
        Rendered(out)
    }
}
