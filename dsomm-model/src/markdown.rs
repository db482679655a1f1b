//! Markdown valued activity fields.

use std::fmt;
use std::sync::OnceLock;

use pulldown_cmark::{html, Options, Parser};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A markdown source string with lazily rendered HTML.
///
/// The HTML is produced on the first call to [`MarkdownText::render`] and
/// reused afterwards.
#[derive(Default)]
pub struct MarkdownText {
    source: String,
    html: OnceLock<String>,
}

impl MarkdownText {
    /// Wrap a markdown source string.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            html: OnceLock::new(),
        }
    }

    /// The markdown source.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Render the markdown to HTML.
    pub fn render(&self) -> &str {
        self.html.get_or_init(|| {
            let mut options = Options::empty();
            options.insert(Options::ENABLE_TABLES);
            options.insert(Options::ENABLE_STRIKETHROUGH);

            let parser = Parser::new_ext(&self.source, options);
            let mut out = String::with_capacity(self.source.len() * 3 / 2);
            html::push_html(&mut out, parser);
            out
        })
    }
}

impl Clone for MarkdownText {
    fn clone(&self) -> Self {
        // HTML is rendered again on demand for the copy.
        Self::new(self.source.clone())
    }
}

impl PartialEq for MarkdownText {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for MarkdownText {}

impl fmt::Debug for MarkdownText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MarkdownText").field(&self.source).finish()
    }
}

impl fmt::Display for MarkdownText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<String> for MarkdownText {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl From<&str> for MarkdownText {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl Serialize for MarkdownText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for MarkdownText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = Option::<String>::deserialize(deserializer)?;
        Ok(Self::new(source.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_returns_source() {
        let text = MarkdownText::new("**bold** text");
        assert_eq!(text.to_string(), "**bold** text");
        assert_eq!(text.as_str(), "**bold** text");
    }

    #[test]
    fn test_render_is_memoized() {
        let text = MarkdownText::new("# Title\n\nSome *emphasis*.");
        let first = text.render();
        assert!(first.contains("<h1>Title</h1>"));
        assert!(first.contains("<em>emphasis</em>"));

        let second = text.render();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_null_deserializes_to_empty() {
        let text: MarkdownText = serde_yaml::from_str("~").unwrap();
        assert!(text.is_empty());
        assert_eq!(text.render(), "");
    }
}
