use std::sync::{Arc, Mutex};

use crate::error::QuillError;
use crate::request::{Response, StreamCallback};

/// Consumer side of the streaming contract.
///
/// The client guarantees: fragments arrive in order, synchronously, on the
/// same logical flow as the network read; their concatenation equals the
/// final Response content; and no fragment follows either terminal call.
/// Implementations must not assume fragment boundaries align with line
/// boundaries — a fragment may split a line anywhere.
pub trait IncrementalRenderer: Send {
    fn push_fragment(&mut self, fragment: &str);
    fn finish(&mut self, response: &Response);
    fn fail(&mut self, error: &QuillError);
}

/// Accumulates streamed fragments and re-derives a line-oriented diff, so a
/// renderer can redraw only lines that changed since its last pass instead
/// of re-parsing the whole text per fragment.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    /// Byte offset of the first line not yet handed out by
    /// `drain_completed_lines`.
    drained: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment; returns the full accumulated content.
    pub fn push(&mut self, fragment: &str) -> &str {
        self.content.push_str(fragment);
        &self.content
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// The trailing line still missing its newline, if any.
    pub fn partial_line(&self) -> &str {
        match self.content.rfind('\n') {
            Some(pos) => &self.content[pos + 1..],
            None => &self.content,
        }
    }

    /// Lines completed (newline-terminated) since the previous call.
    /// Fragments that split a line arbitrarily never produce a line twice.
    pub fn drain_completed_lines(&mut self) -> Vec<String> {
        let tail = &self.content[self.drained..];
        let end = match tail.rfind('\n') {
            Some(pos) => pos + 1,
            None => return Vec::new(),
        };
        let lines = tail[..end]
            .split_inclusive('\n')
            .map(|line| line.trim_end_matches('\n').to_string())
            .collect();
        self.drained += end;
        lines
    }

    /// Hand out whatever remains after the stream ends, newline or not.
    pub fn drain_rest(&mut self) -> Option<String> {
        let tail = &self.content[self.drained..];
        if tail.is_empty() {
            return None;
        }
        let rest = tail.trim_end_matches('\n').to_string();
        self.drained = self.content.len();
        Some(rest)
    }
}

/// Adapt a shared renderer into an `on_stream` callback for
/// [`Request::with_stream`](crate::request::Request::with_stream). The
/// caller keeps the `Arc` and delivers `finish`/`fail` itself once the
/// request settles.
pub fn renderer_callback<R>(renderer: Arc<Mutex<R>>) -> StreamCallback
where
    R: IncrementalRenderer + 'static,
{
    Arc::new(move |fragment: &str| {
        if let Ok(mut guard) = renderer.lock() {
            guard.push_fragment(fragment);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_accumulates_in_order() {
        let mut acc = StreamAccumulator::new();
        acc.push("Hel");
        assert_eq!(acc.push("lo"), "Hello");
        assert_eq!(acc.content(), "Hello");
    }

    #[test]
    fn line_diff_survives_arbitrary_fragment_splits() {
        let mut acc = StreamAccumulator::new();

        acc.push("first li");
        assert!(acc.drain_completed_lines().is_empty());
        assert_eq!(acc.partial_line(), "first li");

        acc.push("ne\nsecond");
        assert_eq!(acc.drain_completed_lines(), vec!["first line"]);
        assert_eq!(acc.partial_line(), "second");

        acc.push(" line\nthird");
        assert_eq!(acc.drain_completed_lines(), vec!["second line"]);

        // No new newline — nothing to hand out.
        assert!(acc.drain_completed_lines().is_empty());
    }

    #[test]
    fn multiple_lines_in_one_fragment() {
        let mut acc = StreamAccumulator::new();
        acc.push("a\nb\nc\n");
        assert_eq!(acc.drain_completed_lines(), vec!["a", "b", "c"]);
        assert!(acc.drain_rest().is_none());
    }

    #[test]
    fn drain_rest_returns_trailing_partial() {
        let mut acc = StreamAccumulator::new();
        acc.push("done\ntail");
        assert_eq!(acc.drain_completed_lines(), vec!["done"]);
        assert_eq!(acc.drain_rest().as_deref(), Some("tail"));
        assert!(acc.drain_rest().is_none());
    }

    #[test]
    fn renderer_callback_feeds_fragments() {
        struct Collecting {
            seen: Vec<String>,
        }
        impl IncrementalRenderer for Collecting {
            fn push_fragment(&mut self, fragment: &str) {
                self.seen.push(fragment.to_string());
            }
            fn finish(&mut self, _response: &Response) {}
            fn fail(&mut self, _error: &QuillError) {}
        }

        let renderer = Arc::new(Mutex::new(Collecting { seen: Vec::new() }));
        let callback = renderer_callback(renderer.clone());
        callback("Hel");
        callback("lo");
        assert_eq!(renderer.lock().unwrap().seen, vec!["Hel", "lo"]);
    }
}
