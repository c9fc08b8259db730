//! Recursive, overlap-aware text chunking.
//!
//! Text is cut into pieces no longer than `max_chars`, trying each separator
//! in priority order (paragraph, line, sentence, clause, word) and falling
//! back to single characters only when nothing coarser applies. Separators
//! stay attached to the piece they end, so the pieces tile the source
//! exactly. Pieces are merged greedily into windows; after each window is
//! emitted a suffix of at most `overlap` characters is carried into the next
//! one. Both stages are pulled on demand: a piece is cut only when the
//! window needs it.

use std::collections::VecDeque;
use std::iter::Peekable;
use std::ops::Range;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{CharSpan, Chunk, Document};

#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Fails with a configuration error when `overlap >= max_chars`.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Lazily split one document. Ordinals start at 0 for every call.
    pub fn split<'a>(&'a self, document: &'a Document) -> Chunks<'a> {
        let text = document.raw_text.as_str();
        let mut stack = Vec::new();
        if !text.trim().is_empty() {
            stack.push(Frame::Split(0..text.len(), 0));
        }
        let pieces = Pieces { text, separators: &self.config.separators, max_chars: self.config.max_chars, stack };
        Chunks {
            text,
            source_name: &document.source_name,
            pieces: pieces.peekable(),
            window: VecDeque::new(),
            window_chars: 0,
            last_end: 0,
            ordinal: 0,
            max_chars: self.config.max_chars,
            overlap: self.config.overlap,
        }
    }
}

enum Frame {
    /// A byte range still to be cut, with the first separator index to try.
    Split(Range<usize>, usize),
    /// A range with no usable separator, emitted one character at a time.
    Chars(Range<usize>),
}

/// Depth-first walk of the separator tree; the stack top is always the
/// leftmost unfinished range.
struct Pieces<'a> {
    text: &'a str,
    separators: &'a [String],
    max_chars: usize,
    stack: Vec<Frame>,
}

impl Iterator for Pieces<'_> {
    type Item = Piece;

    fn next(&mut self) -> Option<Piece> {
        loop {
            match self.stack.pop()? {
                Frame::Chars(range) => {
                    let ch = self.text[range.clone()].chars().next()?;
                    let end = range.start + ch.len_utf8();
                    if end < range.end {
                        self.stack.push(Frame::Chars(end..range.end));
                    }
                    return Some(Piece { start: range.start, end, chars: 1 });
                }
                Frame::Split(range, depth) => {
                    let segment = &self.text[range.clone()];
                    let chars = segment.chars().count();
                    if chars <= self.max_chars {
                        return Some(Piece { start: range.start, end: range.end, chars });
                    }
                    let chosen = self.separators[depth..]
                        .iter()
                        .position(|sep| !sep.is_empty() && segment.contains(sep.as_str()));
                    let Some(idx) = chosen.map(|i| depth + i) else {
                        self.stack.push(Frame::Chars(range));
                        continue;
                    };

                    let separator = self.separators[idx].as_str();
                    let mut parts = Vec::new();
                    let mut start = range.start;
                    for (offset, _) in segment.match_indices(separator) {
                        let end = range.start + offset + separator.len();
                        if end > start {
                            parts.push(start..end);
                            start = end;
                        }
                    }
                    if start < range.end {
                        parts.push(start..range.end);
                    }
                    self.stack.extend(parts.into_iter().rev().map(|part| Frame::Split(part, idx + 1)));
                }
            }
        }
    }
}

/// Finite, non-restartable sequence of chunks for one document.
pub struct Chunks<'a> {
    text: &'a str,
    source_name: &'a str,
    pieces: Peekable<Pieces<'a>>,
    window: VecDeque<Piece>,
    window_chars: usize,
    last_end: usize,
    ordinal: usize,
    max_chars: usize,
    overlap: usize,
}

impl Chunks<'_> {
    fn fill_window(&mut self) {
        while let Some(piece) = self.pieces.peek().copied() {
            if !self.window.is_empty() && self.window_chars + piece.chars > self.max_chars {
                break;
            }
            self.window.push_back(piece);
            self.window_chars += piece.chars;
            self.pieces.next();
        }
    }

    fn carry_overlap(&mut self) {
        let Some(next) = self.pieces.peek().copied() else {
            self.window.clear();
            self.window_chars = 0;
            return;
        };
        while self.window_chars > self.overlap
            || (self.window_chars > 0 && self.window_chars + next.chars > self.max_chars)
        {
            match self.window.pop_front() {
                Some(dropped) => self.window_chars -= dropped.chars,
                None => break,
            }
        }
    }

    fn trimmed_span(&self, start: usize, end: usize) -> CharSpan {
        let raw = &self.text[start..end];
        let lead = raw.len() - raw.trim_start().len();
        let trail = raw.len() - raw.trim_end().len();
        if lead == raw.len() {
            return CharSpan::new(start, start);
        }
        CharSpan::new(start + lead, end - trail)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            self.fill_window();
            let (first, last) = (self.window.front().copied()?, self.window.back().copied()?);
            let span = self.trimmed_span(first.start, last.end);
            self.carry_overlap();

            // whitespace-only windows, or windows adding nothing past the previous chunk
            if span.is_empty() || span.end <= self.last_end {
                continue;
            }
            self.last_end = span.end;
            let chunk = Chunk::new(
                self.source_name,
                self.ordinal,
                self.text[span.as_range()].to_string(),
                span,
            );
            self.ordinal += 1;
            return Some(chunk);
        }
    }
}
