//! PTY output accumulation, carriage-return handling, and flush throttling.
//!
//! Terminals rewrite a line in place with a bare `\r` (progress bars). The
//! accumulator therefore keeps two buffers:
//!
//! - An **emission buffer** holding everything awaiting the next flush. A
//!   bare carriage return truncates the current logical line inside it, so
//!   progress updates are emitted at most once per flush (latest snapshot),
//!   never per update, while `\n`-committed lines accumulate verbatim.
//! - A **scan buffer** holding the current logical line for stop-phrase
//!   detection. It survives flushes, so a phrase split across a flush
//!   boundary is still caught, and it is cleared by both `\n` and bare
//!   `\r`, so a phrase living only inside an overwritten progress segment
//!   never triggers completion.
//!
//! [`OutputThrottle`] bounds the fan-out rate: a batch is flushed no more
//! often than the flush interval, or immediately once the buffered size
//! crosses the byte threshold. The size trigger counts every unflushed
//! byte, including an unterminated line, so a single read slice larger
//! than the threshold still flushes exactly once.

use std::mem;
use std::time::{Duration, Instant};

/// Line accumulator for interactive shell output.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    /// Output awaiting emission, with progress overwrites already applied.
    pending: String,
    /// Byte offset in `pending` where the current logical line begins.
    line_start: usize,
    /// Current logical line, kept for stop-phrase scanning across flushes.
    line: String,
    pending_cr: bool,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a decoded chunk of PTY output.
    ///
    /// Returns `true` when `stop_phrase` appears in a line committed by this
    /// chunk or in the partial line left over once the chunk is fully
    /// processed. Overwritten progress segments are discarded before the
    /// scan happens.
    pub fn push(&mut self, chunk: &str, stop_phrase: &str) -> bool {
        let mut hit = false;

        for ch in chunk.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if ch == '\n' {
                    hit |= self.commit_line(stop_phrase);
                    continue;
                }
                // Bare carriage return: the segment is overwritten in place.
                self.pending.truncate(self.line_start);
                self.line.clear();
            }

            match ch {
                '\r' => self.pending_cr = true,
                '\n' => hit |= self.commit_line(stop_phrase),
                _ => {
                    self.pending.push(ch);
                    self.line.push(ch);
                }
            }
        }

        if !stop_phrase.is_empty() && self.line.contains(stop_phrase) {
            hit = true;
        }
        hit
    }

    fn commit_line(&mut self, stop_phrase: &str) -> bool {
        let hit = !stop_phrase.is_empty() && self.line.contains(stop_phrase);
        self.pending.push('\n');
        self.line_start = self.pending.len();
        self.line.clear();
        hit
    }

    /// Bytes currently buffered for emission, including the unterminated
    /// tail of the current line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take the next batch to emit, if any.
    ///
    /// Drains the emission buffer as-is; the logical-line scan state is
    /// untouched, so stop-phrase detection keeps working across flushes.
    pub fn take_flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        self.line_start = 0;
        Some(mem::take(&mut self.pending))
    }

    /// Drain everything and reset the accumulator.
    pub fn finish(&mut self) -> Option<String> {
        let out = mem::take(&mut self.pending);
        self.line_start = 0;
        self.line.clear();
        self.pending_cr = false;
        if out.is_empty() { None } else { Some(out) }
    }
}

/// Flush pacing for batched output emission.
///
/// Two independent triggers: the byte threshold fires immediately when a
/// read slice pushes the buffer over it; the interval trigger paces the
/// periodic flush tick.
#[derive(Debug)]
pub struct OutputThrottle {
    interval: Duration,
    max_bytes: usize,
    last_flush: Instant,
}

impl OutputThrottle {
    pub fn new(interval: Duration, max_bytes: usize) -> Self {
        Self {
            interval,
            max_bytes,
            last_flush: Instant::now(),
        }
    }

    /// Whether the buffered size alone warrants an immediate flush.
    pub fn size_exceeded(&self, pending_bytes: usize) -> bool {
        pending_bytes >= self.max_bytes
    }

    /// Whether enough time has passed since the last flush.
    pub fn interval_elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.interval
    }

    pub fn mark_flushed(&mut self) {
        self.last_flush = Instant::now();
    }
}
