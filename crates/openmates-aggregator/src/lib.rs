//! Converts a lazy sequence of text chunks into complete paragraphs and fenced
//! code blocks (SPEC_FULL.md §4.C). This is what downstream persistence and the
//! edge treat as "assistant message paragraphs" for incremental delivery.
//!
//! New — there is no teacher equivalent of a stream segmenter, so this module
//! is grounded directly on the spec's state-machine description; the
//! exhaustive boundary-testing style (exact boundary, unicode boundary, empty
//! input) is grounded on `skynet-terminal/src/truncate.rs`'s test module.

use tracing::warn;

const OUTSIDE_SCAN_WINDOW: usize = 8 * 1024;
const FORCE_FLUSH_THRESHOLD: usize = 32 * 1024;
const PARAGRAPH_DELIM: &str = "\n\n";
const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(String),
    CodeBlock(String),
}

impl Block {
    pub fn text(&self) -> &str {
        match self {
            Block::Paragraph(s) | Block::CodeBlock(s) => s,
        }
    }
}

/// Explicit `Outside | InCode` state machine (SPEC_FULL.md §9 redesign note).
#[derive(Debug, Default)]
pub struct StreamAggregator {
    buffer: String,
    in_code: bool,
    /// Opening fence bytes consumed ahead of the code content they introduce
    /// (see the fence-entry branch of `drain`): held here so `take_with_prefix`
    /// can reattach them once the matching closing fence is found, without the
    /// fence itself being mistaken for a closing fence on the next pass.
    pending_prefix: String,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of arbitrary size; returns zero or more now-complete
    /// blocks. Call `finish` once the input is exhausted to flush the tail.
    pub fn feed(&mut self, chunk: &str) -> Vec<Block> {
        self.buffer.push_str(chunk);
        self.drain()
    }

    /// Flush whatever remains once the input stream ends. Logs a warning if a
    /// code block was left unterminated.
    pub fn finish(mut self) -> Option<Block> {
        if self.in_code {
            warn!(len = self.buffer.len(), "stream ended with an unterminated code block");
        }
        let mut remainder = std::mem::take(&mut self.pending_prefix);
        remainder.push_str(&self.buffer);
        if remainder.is_empty() {
            None
        } else if self.in_code {
            Some(Block::CodeBlock(remainder))
        } else {
            Some(Block::Paragraph(remainder))
        }
    }

    fn take_with_prefix(&mut self, end: usize) -> String {
        let mut block: String = self.buffer.drain(..end).collect();
        if !self.pending_prefix.is_empty() {
            let mut prefixed = std::mem::take(&mut self.pending_prefix);
            prefixed.push_str(&block);
            block = prefixed;
        }
        block
    }

    fn drain(&mut self) -> Vec<Block> {
        let mut out = Vec::new();
        loop {
            if self.in_code {
                match self.buffer.find(FENCE) {
                    Some(idx) => {
                        let end = idx + FENCE.len();
                        let block = self.take_with_prefix(end);
                        self.in_code = false;
                        out.push(Block::CodeBlock(block));
                    }
                    None => {
                        if self.buffer.len() > FORCE_FLUSH_THRESHOLD {
                            if let Some(nl) = self.buffer[..FORCE_FLUSH_THRESHOLD].rfind('\n') {
                                let block = self.take_with_prefix(nl + 1);
                                out.push(Block::CodeBlock(block));
                            } else {
                                warn!("code block exceeded force-flush threshold with no newline; flushing verbatim");
                                let block = self.take_with_prefix(FORCE_FLUSH_THRESHOLD);
                                out.push(Block::CodeBlock(block));
                            }
                        } else {
                            break;
                        }
                    }
                }
            } else {
                let window_len = self.buffer.len().min(OUTSIDE_SCAN_WINDOW);
                let window = &self.buffer[..window_len];
                let para_idx = window.find(PARAGRAPH_DELIM);
                let fence_idx = window.find(FENCE);

                match (para_idx, fence_idx) {
                    (None, None) => {
                        if self.buffer.len() > FORCE_FLUSH_THRESHOLD {
                            if let Some(nl) = window.rfind('\n') {
                                let block = self.take_with_prefix(nl + 1);
                                out.push(Block::Paragraph(block));
                            } else {
                                warn!("paragraph exceeded force-flush threshold with no newline; flushing window verbatim");
                                let block = self.take_with_prefix(window_len);
                                out.push(Block::Paragraph(block));
                            }
                        } else {
                            break;
                        }
                    }
                    (Some(0), _) => {
                        // The window starts with the delimiter itself: there is
                        // no content before it to close off a block with, and
                        // emitting it now would produce a block beginning with
                        // "\n\n". Wait for more input (or force-flush like the
                        // no-delimiter case) instead of emitting or discarding it.
                        if self.buffer.len() > FORCE_FLUSH_THRESHOLD {
                            if let Some(nl) = window.rfind('\n') {
                                let block = self.take_with_prefix(nl + 1);
                                out.push(Block::Paragraph(block));
                            } else {
                                warn!("paragraph exceeded force-flush threshold with no newline; flushing window verbatim");
                                let block = self.take_with_prefix(window_len);
                                out.push(Block::Paragraph(block));
                            }
                        } else {
                            break;
                        }
                    }
                    (Some(p), fence) if fence.map(|f| p <= f).unwrap_or(true) => {
                        let end = p + PARAGRAPH_DELIM.len();
                        let block = self.take_with_prefix(end);
                        out.push(Block::Paragraph(block));
                    }
                    (Some(p), None) => {
                        let end = p + PARAGRAPH_DELIM.len();
                        let block = self.take_with_prefix(end);
                        out.push(Block::Paragraph(block));
                    }
                    (_, Some(f)) => {
                        if f == 0 {
                            let fence: String = self.buffer.drain(..FENCE.len()).collect();
                            self.pending_prefix.push_str(&fence);
                            self.in_code = true;
                        } else {
                            let block = self.take_with_prefix(f);
                            out.push(Block::Paragraph(block));
                            let fence: String = self.buffer.drain(..FENCE.len()).collect();
                            self.pending_prefix.push_str(&fence);
                            self.in_code = true;
                        }
                    }
                }
            }
        }
        out
    }
}
