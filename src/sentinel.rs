//! Completion markers for tracked commands.
//!
//! A tracked command is followed by a probe line that makes the shell print
//! `\x1eTERMBROKER_DONE <id> <status>\x1e`. The probe itself only contains the
//! escaped `\036` text, so a terminal echo of the line never looks like a marker.
//! [`OutputDecoder`] removes markers from the output stream and reports them.
//! Behind a pseudo-terminal it also drops the echo of each probe line it was
//! told to expect through [`PendingEchoes`].

use crate::protocol::is_valid_command_id;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DELIMITER: u8 = 0x1e;
const MARKER_TAG: &str = "TERMBROKER_DONE";
const MAX_MARKER_LEN: usize = 128;

/// Shell line that reports the exit status of the preceding command.
pub fn completion_probe(command_id: &str) -> String {
    format!("printf '\\036{MARKER_TAG} %s %d\\036\\n' '{command_id}' \"$?\"\n")
}

/// What a terminal echoes back for the probe of `command_id`, without the line ending.
fn echoed_probe(command_id: &str) -> Vec<u8> {
    completion_probe(command_id)
        .trim_end_matches('\n')
        .as_bytes()
        .to_vec()
}

/// Probe lines written to a terminal whose echo has not been seen yet.
///
/// Shared between the writer side, which registers a probe before sending
/// it, and the decoder reading the terminal output.
#[derive(Debug, Clone, Default)]
pub struct PendingEchoes {
    lines: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl PendingEchoes {
    pub fn expect(&self, command_id: &str) {
        self.lock()
            .push((command_id.to_string(), echoed_probe(command_id)));
    }

    pub fn forget(&self, command_id: &str) {
        self.lock().retain(|(id, _)| id != command_id);
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Vec<u8>)>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Text(String),
    Completed { command_id: String, exit_code: i32 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum NewlineSkip {
    #[default]
    None,
    /// A marker ended exactly at the chunk boundary.
    Line,
    /// A marker was followed by `\r` at the chunk boundary.
    LineFeed,
}

/// Incremental decoder for one output stream.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    buf: Vec<u8>,
    skip: NewlineSkip,
    echoes: PendingEchoes,
}

impl OutputDecoder {
    /// A decoder that also strips the echoed probe lines registered in `echoes`.
    pub fn with_echoes(echoes: PendingEchoes) -> Self {
        Self {
            echoes,
            ..Self::default()
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let chunk = self.strip_pending_newline(chunk);
        self.buf.extend_from_slice(chunk);
        let limit = self.strip_echoes();

        let mut events = Vec::new();
        let mut text = Vec::new();
        let mut pos = 0;

        loop {
            let Some(offset) = self.buf[pos..limit].iter().position(|&b| b == DELIMITER) else {
                text.extend_from_slice(&self.buf[pos..limit]);
                pos = limit;
                break;
            };
            let start = pos + offset;
            let body = start + 1;
            text.extend_from_slice(&self.buf[pos..start]);

            match self.buf[body..limit].iter().position(|&b| b == DELIMITER) {
                Some(len) => match parse_marker(&self.buf[body..body + len]) {
                    Some((command_id, exit_code)) => {
                        push_text(&mut events, &mut text);
                        // The echo always precedes the result; one still pending never came.
                        self.echoes.forget(&command_id);
                        events.push(Decoded::Completed {
                            command_id,
                            exit_code,
                        });
                        pos = self.skip_newline_at(body + len + 1);
                    }
                    None => {
                        text.push(DELIMITER);
                        pos = body;
                    }
                },
                None if limit - start > MAX_MARKER_LEN => {
                    text.push(DELIMITER);
                    pos = body;
                }
                None => {
                    // Possibly a marker split across reads; hold it back.
                    pos = start;
                    break;
                }
            }
        }

        self.buf.drain(..pos);
        if self.buf.is_empty() {
            // Carry an incomplete UTF-8 sequence over to the next read.
            let keep = incomplete_utf8_tail(&text);
            self.buf.extend_from_slice(&text[text.len() - keep..]);
            text.truncate(text.len() - keep);
        }
        push_text(&mut events, &mut text);
        events
    }

    /// Flush whatever is buffered once the stream has ended.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut text = std::mem::take(&mut self.buf);
        let mut events = Vec::new();
        push_text(&mut events, &mut text);
        events
    }

    /// Remove complete probe echoes from the buffer. Returns how much of the
    /// buffer may be decoded now; the rest could be the start of an echo.
    fn strip_echoes(&mut self) -> usize {
        let shared = self.echoes.clone();
        let mut echoes = shared.lock();
        if echoes.is_empty() {
            return self.buf.len();
        }

        let mut i = 0;
        while i < echoes.len() {
            let line = &echoes[i].1;
            let found = self
                .buf
                .windows(line.len())
                .position(|window| window == line.as_slice());
            match found {
                Some(start) => {
                    let end = self.skip_newline_at(start + line.len());
                    self.buf.drain(start..end);
                    echoes.remove(i);
                }
                None => i += 1,
            }
        }

        let limit = echoes
            .iter()
            .map(|(_, line)| self.buf.len() - partial_suffix(&self.buf, line))
            .min()
            .unwrap_or(self.buf.len());
        limit
    }

    fn skip_newline_at(&mut self, mut pos: usize) -> usize {
        let rest = &self.buf[pos..];
        if rest.starts_with(b"\r\n") {
            pos += 2;
        } else if rest.starts_with(b"\n") {
            pos += 1;
        } else if rest == b"\r" {
            pos += 1;
            self.skip = NewlineSkip::LineFeed;
        } else if rest.is_empty() {
            self.skip = NewlineSkip::Line;
        }
        pos
    }

    fn strip_pending_newline<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        if chunk.is_empty() {
            return chunk;
        }
        let skip = std::mem::take(&mut self.skip);
        match skip {
            NewlineSkip::None => chunk,
            NewlineSkip::Line => chunk
                .strip_prefix(b"\r\n")
                .or_else(|| chunk.strip_prefix(b"\n"))
                .unwrap_or(chunk),
            NewlineSkip::LineFeed => chunk.strip_prefix(b"\n").unwrap_or(chunk),
        }
    }
}

fn push_text(events: &mut Vec<Decoded>, text: &mut Vec<u8>) {
    if !text.is_empty() {
        events.push(Decoded::Text(String::from_utf8_lossy(text).into_owned()));
        text.clear();
    }
}

fn parse_marker(body: &[u8]) -> Option<(String, i32)> {
    let body = std::str::from_utf8(body).ok()?;
    let rest = body.strip_prefix(MARKER_TAG)?.strip_prefix(' ')?;
    let mut parts = rest.split(' ');
    let (id, code) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || !is_valid_command_id(id) {
        return None;
    }
    Some((id.to_string(), code.parse().ok()?))
}

/// Length of the longest proper prefix of `line` that `buf` ends with.
fn partial_suffix(buf: &[u8], line: &[u8]) -> usize {
    let max = line.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&k| buf.ends_with(&line[..k]))
        .unwrap_or(0)
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => 0,
        Err(e) if e.error_len().is_none() => bytes.len() - e.valid_up_to(),
        Err(_) => 0,
    }
}
