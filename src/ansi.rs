// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! ANSI style extraction.
//!
//! Installer output is a linear byte stream sprinkled with SGR escape
//! sequences. The [`AnsiDecoder`] consumes that stream in arbitrary chunks,
//! strips every escape sequence, and hands back plain text spans tagged with
//! the styles that were active when the text arrived. It does not emulate a
//! terminal. Cursor movement, screen clearing, and window titles are simply
//! dropped.
//!
//! # Span Boundaries
//!
//! A span ends at a newline or at an SGR sequence that changes the active
//! style. Text after the last newline is held back until one of those
//! happens, or until [`AnsiDecoder::finish`] is called. This keeps the
//! produced spans identical no matter how the stream was chunked.

use std::collections::BTreeSet;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// INVARIANT: Unterminated sequences longer than this are swallowed up to
// their terminator instead of being held back.
const MAX_SEQUENCE_LEN: usize = 64;

const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

const BASE_PALETTE: [(u8, u8, u8); 16] = [
    (0, 0, 0),
    (205, 0, 0),
    (0, 205, 0),
    (205, 205, 0),
    (0, 0, 238),
    (205, 0, 205),
    (0, 205, 205),
    (229, 229, 229),
    (127, 127, 127),
    (255, 0, 0),
    (0, 255, 0),
    (255, 255, 0),
    (92, 92, 255),
    (255, 0, 255),
    (0, 255, 255),
    (255, 255, 255),
];

/// Map 256-color palette index to RGB.
///
/// Indices 0 to 15 use the basic xterm palette, 16 to 231 the 6x6x6 color
/// cube, and 232 to 255 the 24-step grayscale ramp.
pub fn indexed_rgb(index: u8) -> (u8, u8, u8) {
    match index {
        0..=15 => BASE_PALETTE[index as usize],
        16..=231 => {
            let cube = index - 16;
            (
                CUBE_LEVELS[(cube / 36) as usize],
                CUBE_LEVELS[((cube / 6) % 6) as usize],
                CUBE_LEVELS[(cube % 6) as usize],
            )
        }
        232..=255 => {
            let level = 8 + 10 * (index - 232);
            (level, level, level)
        }
    }
}

/// One of the eight named terminal colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NamedColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl NamedColor {
    fn from_offset(offset: u16) -> Option<Self> {
        let color = match offset {
            0 => Self::Black,
            1 => Self::Red,
            2 => Self::Green,
            3 => Self::Yellow,
            4 => Self::Blue,
            5 => Self::Magenta,
            6 => Self::Cyan,
            7 => Self::White,
            _ => return None,
        };

        Some(color)
    }
}

/// Terminal color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Color {
    /// Normal intensity named color (SGR 30-37, 40-47).
    Basic(NamedColor),

    /// High intensity named color (SGR 90-97, 100-107).
    Bright(NamedColor),

    /// Entry of the 256-color palette (SGR 38;5;n, 48;5;n).
    Indexed(u8),
}

impl Color {
    /// RGB value of color under the standard xterm palette.
    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Self::Basic(color) => indexed_rgb(*color as u8),
            Self::Bright(color) => indexed_rgb(*color as u8 + 8),
            Self::Indexed(index) => indexed_rgb(*index),
        }
    }
}

/// Style attribute attached to a span of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StyleTag {
    Bold,
    Dim,
    Italic,
    Underline,
    Foreground(Color),
    Background(Color),
}

/// Text with the styles that were active when it was written.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnsiSpan {
    pub text: String,
    pub styles: BTreeSet<StyleTag>,
}

impl AnsiSpan {
    /// Construct new span.
    pub fn new(text: impl Into<String>, styles: impl IntoIterator<Item = StyleTag>) -> Self {
        Self {
            text: text.into(),
            styles: styles.into_iter().collect(),
        }
    }

    /// Check if span carries no style at all.
    pub fn is_plain(&self) -> bool {
        self.styles.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Style {
    bold: bool,
    dim: bool,
    italic: bool,
    underline: bool,
    fg: Option<Color>,
    bg: Option<Color>,
}

impl Style {
    fn tags(&self) -> BTreeSet<StyleTag> {
        let mut tags = BTreeSet::new();
        if self.bold {
            tags.insert(StyleTag::Bold);
        }
        if self.dim {
            tags.insert(StyleTag::Dim);
        }
        if self.italic {
            tags.insert(StyleTag::Italic);
        }
        if self.underline {
            tags.insert(StyleTag::Underline);
        }
        if let Some(fg) = self.fg {
            tags.insert(StyleTag::Foreground(fg));
        }
        if let Some(bg) = self.bg {
            tags.insert(StyleTag::Background(bg));
        }
        tags
    }

    fn apply(&mut self, params: &[u16]) {
        if params.is_empty() {
            *self = Style::default();
            return;
        }

        let mut iter = params.iter().copied();
        while let Some(code) = iter.next() {
            match code {
                0 => *self = Style::default(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                30..=37 => self.fg = NamedColor::from_offset(code - 30).map(Color::Basic),
                39 => self.fg = None,
                40..=47 => self.bg = NamedColor::from_offset(code - 40).map(Color::Basic),
                49 => self.bg = None,
                90..=97 => self.fg = NamedColor::from_offset(code - 90).map(Color::Bright),
                100..=107 => self.bg = NamedColor::from_offset(code - 100).map(Color::Bright),
                38 | 48 => {
                    let color = extended_color(&mut iter);
                    match (code, color) {
                        (38, Some(color)) => self.fg = Some(color),
                        (48, Some(color)) => self.bg = Some(color),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }
}

// Consume parameters of an extended color selector. True color is consumed
// but not tracked.
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next() {
        Some(5) => iter
            .next()
            .and_then(|index| u8::try_from(index).ok())
            .map(Color::Indexed),
        Some(2) => {
            iter.nth(2);
            None
        }
        _ => None,
    }
}

enum Sequence {
    /// Complete SGR sequence with its parameters.
    Sgr(Option<Vec<u16>>),

    /// Complete escape sequence of no interest.
    Other,

    /// Sequence is cut off at end of buffer.
    Partial,

    /// Sequence outgrew any sane length before its terminator showed up.
    Overlong(Skip),
}

/// Unterminated sequence being swallowed until its terminator arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    Csi,
    Osc { escape: bool },
}

impl Skip {
    // Next skip state after `byte`, or `None` once the sequence ended.
    fn advance(self, byte: u8) -> Option<Self> {
        match self {
            Self::Csi if (0x40..=0x7e).contains(&byte) => None,
            Self::Csi => Some(Self::Csi),
            Self::Osc { .. } if byte == BEL => None,
            Self::Osc { escape: true } if byte == b'\\' => None,
            Self::Osc { .. } => Some(Self::Osc { escape: byte == ESC }),
        }
    }
}

/// Stateful SGR decoder.
#[derive(Debug, Default, Clone)]
pub struct AnsiDecoder {
    style: Style,
    pending: Vec<u8>,
    text: Vec<u8>,
    skip: Option<Skip>,
}

impl AnsiDecoder {
    /// Construct new decoder with no active style.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed next chunk of stream, returning every span that got completed.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<AnsiSpan> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk.as_ref());

        let mut spans = Vec::new();
        let mut pos = 0;
        while pos < input.len() {
            let byte = input[pos];
            if let Some(skip) = self.skip {
                self.skip = skip.advance(byte);
                pos += 1;
                continue;
            }

            if byte != ESC {
                self.text.push(byte);
                pos += 1;
                if byte == b'\n' {
                    self.emit(&mut spans);
                }
                continue;
            }

            let (sequence, len) = parse_escape(&input[pos..]);
            match sequence {
                Sequence::Partial => {
                    self.pending = input[pos..].to_vec();
                    break;
                }
                Sequence::Overlong(skip) => self.skip = Some(skip),
                Sequence::Other => {}
                Sequence::Sgr(None) => {}
                Sequence::Sgr(Some(params)) => {
                    let mut next = self.style;
                    next.apply(&params);
                    if next != self.style {
                        self.emit(&mut spans);
                        self.style = next;
                    }
                }
            }
            pos += len;
        }

        spans
    }

    /// Emit any held back text, e.g., a prompt without trailing newline.
    pub fn finish(&mut self) -> Vec<AnsiSpan> {
        let mut spans = Vec::new();
        self.pending.clear();
        self.skip = None;
        self.emit(&mut spans);
        spans
    }

    /// Drop all state, returning to no active style.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn emit(&mut self, spans: &mut Vec<AnsiSpan>) {
        if self.text.is_empty() {
            return;
        }

        // INVARIANT: Text only breaks at newline or escape bytes, so a
        // multi-byte character is never split unless the stream ends early.
        let bytes = std::mem::take(&mut self.text);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        spans.push(AnsiSpan {
            text,
            styles: self.style.tags(),
        });
    }
}

// Parse escape sequence at start of `input`, returning it with its length.
fn parse_escape(input: &[u8]) -> (Sequence, usize) {
    let Some(&kind) = input.get(1) else {
        return (Sequence::Partial, input.len());
    };

    match kind {
        b'[' => {
            let body = &input[2..];
            let Some(end) = body.iter().position(|byte| (0x40..=0x7e).contains(byte)) else {
                return incomplete(input, Skip::Csi);
            };

            let len = end + 3;
            if body[end] != b'm' {
                return (Sequence::Other, len);
            }

            (Sequence::Sgr(parse_params(&body[..end])), len)
        }
        b']' => {
            // OSC, terminated by BEL or ST.
            let body = &input[2..];
            for (idx, byte) in body.iter().enumerate() {
                if *byte == BEL {
                    return (Sequence::Other, idx + 3);
                }
                if *byte == ESC && body.get(idx + 1) == Some(&b'\\') {
                    return (Sequence::Other, idx + 4);
                }
            }
            let escape = input.last() == Some(&ESC);
            incomplete(input, Skip::Osc { escape })
        }
        // Character set designation carries one more byte.
        b'(' | b')' | b'*' | b'+' => {
            if input.len() < 3 {
                (Sequence::Partial, input.len())
            } else {
                (Sequence::Other, 3)
            }
        }
        _ => (Sequence::Other, 2),
    }
}

// Everything in `input` belongs to the sequence. Overlong ones keep being
// swallowed in later chunks until their terminator.
fn incomplete(input: &[u8], skip: Skip) -> (Sequence, usize) {
    if input.len() > MAX_SEQUENCE_LEN {
        (Sequence::Overlong(skip), input.len())
    } else {
        (Sequence::Partial, input.len())
    }
}

fn parse_params(raw: &[u8]) -> Option<Vec<u16>> {
    let raw = std::str::from_utf8(raw).ok()?;
    if raw.is_empty() {
        return Some(Vec::new());
    }

    raw.split([';', ':'])
        .map(|param| {
            if param.is_empty() {
                Some(0)
            } else {
                param.parse::<u16>().ok()
            }
        })
        .collect()
}

/// Strip every escape sequence from text.
pub fn strip(text: &str) -> String {
    let mut decoder = AnsiDecoder::new();
    let mut spans = decoder.feed(text);
    spans.extend(decoder.finish());
    spans.into_iter().map(|span| span.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn decode_all<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<AnsiSpan> {
        let mut decoder = AnsiDecoder::new();
        let mut spans = Vec::new();
        for chunk in chunks {
            spans.extend(decoder.feed(chunk));
        }
        spans.extend(decoder.finish());
        spans
    }

    fn red() -> StyleTag {
        StyleTag::Foreground(Color::Basic(NamedColor::Red))
    }

    #[test]
    fn decode_single_styled_span() {
        let mut decoder = AnsiDecoder::new();
        let spans = decoder.feed("\x1b[31mHELLO\x1b[0m");

        assert_eq!(spans, vec![AnsiSpan::new("HELLO", [red()])]);
        assert_eq!(decoder.feed("tail"), vec![]);
        assert_eq!(decoder.finish(), vec![AnsiSpan::new("tail", [])]);
    }

    #[test]
    fn split_anywhere_yields_same_spans() {
        let input = "plain \x1b[1;38;5;196mwarn\x1b[22m still red\n\x1b[mnext\nline";
        let bytes = input.as_bytes();
        let whole = decode_all(&[bytes]);

        for cut in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(cut);
            assert_eq!(decode_all(&[head, tail]), whole, "split at {cut}");
        }
    }

    #[test]
    fn split_inside_escape_sequence() {
        let mut decoder = AnsiDecoder::new();
        assert_eq!(decoder.feed("\x1b["), vec![]);
        assert_eq!(decoder.feed("3"), vec![]);
        assert_eq!(decoder.feed("1mHELLO"), vec![]);
        assert_eq!(decoder.feed("\x1b[0m"), vec![AnsiSpan::new("HELLO", [red()])]);
    }

    #[test]
    fn split_inside_multibyte_character() {
        let text = "ok ✓\n".as_bytes();
        let (head, tail) = text.split_at(4);
        assert_eq!(decode_all(&[head, tail]), vec![AnsiSpan::new("ok ✓\n", [])]);
    }

    #[test]
    fn multiple_codes_in_one_sequence() {
        let spans = decode_all(&[b"\x1b[1;4;44;93mX\x1b[0m"]);
        assert_eq!(
            spans,
            vec![AnsiSpan::new(
                "X",
                [
                    StyleTag::Bold,
                    StyleTag::Underline,
                    StyleTag::Background(Color::Basic(NamedColor::Blue)),
                    StyleTag::Foreground(Color::Bright(NamedColor::Yellow)),
                ]
            )]
        );
    }

    #[test]
    fn same_category_overrides() {
        let spans = decode_all(&[b"\x1b[31ma\x1b[32mb\x1b[39mc"]);
        assert_eq!(
            spans,
            vec![
                AnsiSpan::new("a", [red()]),
                AnsiSpan::new("b", [StyleTag::Foreground(Color::Basic(NamedColor::Green))]),
                AnsiSpan::new("c", []),
            ]
        );
    }

    #[test]
    fn bare_reset_clears_everything() {
        let spans = decode_all(&[b"\x1b[1;3;2;48;5;17mx\x1b[my"]);
        assert_eq!(spans[1], AnsiSpan::new("y", []));
        assert!(spans[0].styles.contains(&StyleTag::Background(Color::Indexed(17))));
        assert!(spans[0].styles.contains(&StyleTag::Italic));
        assert!(spans[0].styles.contains(&StyleTag::Dim));
    }

    #[test]
    fn unknown_and_non_sgr_sequences_are_dropped() {
        let spans = decode_all(&[b"\x1b[2K\x1b[1G\x1b]0;title\x07\x1b[5;53mok\x1b(B\n"]);
        assert_eq!(spans, vec![AnsiSpan::new("ok\n", [])]);
    }

    #[test]
    fn malformed_parameters_are_ignored() {
        let spans = decode_all(&[b"\x1b[?25mA\x1b[38;5;999mB\x1b[38;2;1;2;3;1mC"]);
        assert_eq!(
            spans,
            vec![AnsiSpan::new("AB", []), AnsiSpan::new("C", [StyleTag::Bold])]
        );
    }

    #[test]
    fn overlong_title_is_dropped_wherever_split() {
        let mut input = b"before\n\x1b]0;".to_vec();
        input.extend(std::iter::repeat(b'x').take(100));
        input.extend_from_slice(b"\x1b\\after\n");
        let whole = decode_all(&[&input]);
        assert_eq!(
            whole,
            vec![AnsiSpan::new("before\n", []), AnsiSpan::new("after\n", [])]
        );

        for cut in 0..=input.len() {
            let (head, tail) = input.split_at(cut);
            assert_eq!(decode_all(&[head, tail]), whole, "split at {cut}");
        }
    }

    #[test]
    fn overlong_csi_is_dropped_up_to_final_byte() {
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b'1').take(80));
        let (head, tail) = input.split_at(70);
        let mut decoder = AnsiDecoder::new();

        assert_eq!(decoder.feed(head), vec![]);
        assert_eq!(decoder.feed(tail), vec![]);
        assert_eq!(decoder.feed("Hok\n"), vec![AnsiSpan::new("ok\n", [])]);
    }

    #[test]
    fn strip_escape_sequences() {
        assert_eq!(strip("\x1b[1;32m==>\x1b[0m done\r\n"), "==> done\r\n");
    }

    #[test_case(0, (0, 0, 0); "first basic")]
    #[test_case(15, (255, 255, 255); "last bright")]
    #[test_case(16, (0, 0, 0); "cube origin")]
    #[test_case(196, (255, 0, 0); "cube red")]
    #[test_case(231, (255, 255, 255); "cube corner")]
    #[test_case(232, (8, 8, 8); "darkest gray")]
    #[test_case(255, (238, 238, 238); "lightest gray")]
    #[test]
    fn map_palette_index(index: u8, expect: (u8, u8, u8)) {
        use pretty_assertions::assert_eq;

        assert_eq!(indexed_rgb(index), expect);
        assert_eq!(indexed_rgb(index), Color::Indexed(index).rgb());
    }

    #[test]
    fn grayscale_ends_are_distinct() {
        assert_ne!(indexed_rgb(232), indexed_rgb(255));
        assert!(indexed_rgb(232).0 < indexed_rgb(255).0);
    }
}
