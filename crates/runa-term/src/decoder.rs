// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Byte-to-key decoder for a terminal in raw mode.
//!
//! A pure state machine: `feed` maps one input byte to zero or more key
//! events, `notify_timeout` injects the backslash-enter window expiry, and
//! `flush` drains whatever is buffered at stream end.  The only
//! asynchronous input (the 25 ms backslash timer) is modelled as a
//! timeout event fed into the same machine, so the whole decoder is
//! testable without a terminal or a clock.

use std::time::Duration;

use tracing::warn;

use crate::key::Key;

/// Cap on a buffered CSI sequence.  Overflow flushes the buffer and the
/// stream re-enters normal processing.
pub const MAX_SEQUENCE_BYTES: usize = 256;

/// How long a lone backslash is held waiting for a `\r` that would make it
/// a shift-enter.
pub const BACKSLASH_ENTER_WINDOW: Duration = Duration::from_millis(25);

const ESC: u8 = 0x1b;
const CTRL_C: u8 = 0x03;
const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    /// Saw ESC, waiting to learn whether a CSI follows.
    Escape,
    /// Buffering a CSI sequence (`seq` holds `ESC [` onward).
    Csi,
    /// Between bracketed-paste sentinels.
    Paste,
}

#[derive(Debug)]
pub struct KeypressDecoder {
    state: State,
    seq: Vec<u8>,
    paste_buf: Vec<u8>,
    holding_backslash: bool,
}

impl Default for KeypressDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeypressDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            seq: Vec::new(),
            paste_buf: Vec::new(),
            holding_backslash: false,
        }
    }

    /// True while a lone backslash is held; the caller should arm the
    /// [`BACKSLASH_ENTER_WINDOW`] timer and call [`notify_timeout`] when it
    /// fires.
    ///
    /// [`notify_timeout`]: Self::notify_timeout
    pub fn is_holding_backslash(&self) -> bool {
        self.holding_backslash
    }

    /// Feed one input byte; returns the keys it completed.
    pub fn feed(&mut self, byte: u8) -> Vec<Key> {
        let mut keys = Vec::new();

        if self.holding_backslash {
            self.holding_backslash = false;
            if byte == b'\r' {
                keys.push(
                    Key::named("return").shift().with_sequence("\\\r"),
                );
                return keys;
            }
            keys.push(Key::named("\\"));
            // Fall through: the byte after the flushed backslash is
            // processed normally.
        }

        // Ctrl-C preempts any in-progress buffering.
        if byte == CTRL_C && self.state != State::Paste {
            self.seq.clear();
            self.state = State::Ground;
            keys.push(Key::named("c").ctrl().with_sequence("\u{3}"));
            return keys;
        }

        match self.state {
            State::Ground => keys.extend(self.feed_ground(byte)),
            State::Escape => keys.extend(self.feed_escape(byte)),
            State::Csi => keys.extend(self.feed_csi(byte)),
            State::Paste => keys.extend(self.feed_paste(byte)),
        }
        keys
    }

    /// The backslash window expired without a `\r`: release the held key.
    pub fn notify_timeout(&mut self) -> Vec<Key> {
        if self.holding_backslash {
            self.holding_backslash = false;
            vec![Key::named("\\")]
        } else {
            Vec::new()
        }
    }

    /// Stream end: drain everything still buffered.  A paste without its
    /// terminator flushes as a single paste key.
    pub fn flush(&mut self) -> Vec<Key> {
        let mut keys = Vec::new();
        if self.holding_backslash {
            self.holding_backslash = false;
            keys.push(Key::named("\\"));
        }
        match self.state {
            State::Paste => {
                let buf = std::mem::take(&mut self.paste_buf);
                keys.push(Key::paste(String::from_utf8_lossy(&buf).into_owned()));
            }
            State::Escape => keys.push(Key::named("escape").with_sequence("\u{1b}")),
            State::Csi => {
                // An unfinished CSI has no key interpretation; drop it.
                self.seq.clear();
            }
            State::Ground => {}
        }
        self.state = State::Ground;
        keys
    }

    fn feed_ground(&mut self, byte: u8) -> Vec<Key> {
        match byte {
            ESC => {
                self.state = State::Escape;
                Vec::new()
            }
            b'\\' => {
                self.holding_backslash = true;
                Vec::new()
            }
            b'\r' | b'\n' => vec![Key::named("return").with_sequence("\r")],
            b'\t' => vec![Key::named("tab").with_sequence("\t")],
            0x7f => vec![Key::named("backspace").with_sequence("\u{7f}")],
            // Remaining C0 controls are ctrl+letter.
            0x01..=0x1a => {
                let letter = (byte + b'a' - 1) as char;
                vec![Key::named(letter.to_string())
                    .ctrl()
                    .with_sequence((byte as char).to_string())]
            }
            _ => {
                let c = byte as char;
                vec![Key::named(c.to_string())]
            }
        }
    }

    fn feed_escape(&mut self, byte: u8) -> Vec<Key> {
        match byte {
            b'[' => {
                self.state = State::Csi;
                self.seq = vec![ESC, b'['];
                Vec::new()
            }
            ESC => vec![Key::named("escape").with_sequence("\u{1b}")],
            _ => {
                self.state = State::Ground;
                vec![Key::named((byte as char).to_string())
                    .meta()
                    .with_sequence(format!("\u{1b}{}", byte as char))]
            }
        }
    }

    fn feed_csi(&mut self, byte: u8) -> Vec<Key> {
        self.seq.push(byte);

        if self.seq.len() > MAX_SEQUENCE_BYTES {
            let prefix: String = String::from_utf8_lossy(&self.seq[..16]).into_owned();
            warn!(
                buffered = self.seq.len(),
                prefix = %prefix.escape_debug(),
                "escape sequence exceeded buffer cap; discarding"
            );
            self.seq.clear();
            self.state = State::Ground;
            return Vec::new();
        }

        // CSI sequences terminate on a byte in 0x40..=0x7e.
        if !(0x40..=0x7e).contains(&byte) {
            return Vec::new();
        }

        let seq = std::mem::take(&mut self.seq);
        self.state = State::Ground;
        let params = String::from_utf8_lossy(&seq[2..seq.len() - 1]).into_owned();
        let sequence = String::from_utf8_lossy(&seq).into_owned();

        match byte {
            // Arrow keys never accumulate; they resolve as soon as their
            // final byte arrives, with or without a modifier parameter.
            b'A' | b'B' | b'C' | b'D' => {
                let name = match byte {
                    b'A' => "up",
                    b'B' => "down",
                    b'C' => "right",
                    _ => "left",
                };
                let (_, modifiers) = parse_params(&params);
                vec![apply_modifiers(
                    Key::named(name).with_sequence(sequence),
                    modifiers,
                )]
            }
            b'u' | b'~' => {
                if self.handle_paste_sentinel(&params) {
                    return Vec::new();
                }
                let (code, modifiers) = parse_params(&params);
                match extended_key_name(code, byte) {
                    Some(name) => {
                        let key = Key::named(name).with_sequence(sequence).extended();
                        vec![apply_modifiers(key, modifiers)]
                    }
                    None => {
                        warn!(code, "unrecognised extended key code");
                        Vec::new()
                    }
                }
            }
            b'H' => vec![Key::named("home").with_sequence(sequence)],
            b'F' => vec![Key::named("end").with_sequence(sequence)],
            _ => Vec::new(),
        }
    }

    fn handle_paste_sentinel(&mut self, params: &str) -> bool {
        match params {
            "200" => {
                self.state = State::Paste;
                self.paste_buf.clear();
                true
            }
            // A stray end sentinel outside a paste is dropped.
            "201" => true,
            _ => false,
        }
    }

    fn feed_paste(&mut self, byte: u8) -> Vec<Key> {
        self.paste_buf.push(byte);
        if self.paste_buf.ends_with(PASTE_END) {
            let content_len = self.paste_buf.len() - PASTE_END.len();
            self.paste_buf.truncate(content_len);
            let buf = std::mem::take(&mut self.paste_buf);
            self.state = State::Ground;
            return vec![Key::paste(String::from_utf8_lossy(&buf).into_owned())];
        }
        Vec::new()
    }
}

/// Split `"keycode;modifiers"` CSI parameters.  Both default sensibly when
/// absent.
fn parse_params(params: &str) -> (u32, u8) {
    let mut split = params.split(';');
    let code = split.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let modifiers: u8 = split.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    (code, modifiers.saturating_sub(1))
}

/// Apply a `modifiers − 1` bit set: shift=1, alt=2, ctrl=4.
fn apply_modifiers(mut key: Key, bits: u8) -> Key {
    if bits & 1 != 0 {
        key.shift = true;
    }
    if bits & 2 != 0 {
        key.meta = true;
    }
    if bits & 4 != 0 {
        key.ctrl = true;
    }
    key
}

fn extended_key_name(code: u32, terminator: u8) -> Option<String> {
    let name = match code {
        27 => "escape",
        13 => "return",
        57414 => "return", // numpad enter
        9 => "tab",
        127 => "backspace",
        97..=122 => {
            return Some(((code as u8) as char).to_string());
        }
        // Legacy tilde codes.
        2 if terminator == b'~' => "insert",
        3 if terminator == b'~' => "delete",
        5 if terminator == b'~' => "pageup",
        6 if terminator == b'~' => "pagedown",
        1 | 7 if terminator == b'~' => "home",
        4 | 8 if terminator == b'~' => "end",
        _ => return None,
    };
    Some(name.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
