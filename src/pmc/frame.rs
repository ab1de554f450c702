// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode the carriage-return framed PMC serial protocol.
// Author: Lukas Bower

//! Wire frame codec for the PMC serial protocol.
//!
//! Every frame is a run of printable US-ASCII bytes terminated by a single
//! carriage return. The PMC disambiguates frame kinds by content alone:
//! `ACK`, `ERR` and `ALERT` are bare keywords, everything else is a
//! `CODE=VALUE` getter response.

/// Frame terminator on the wire.
pub const TERMINATOR: u8 = 0x0D;

/// Bytes stripped from both ends of a received frame.
const STRIP: &[u8] = b" \n\t";

const RESPONSE_ACKNOWLEDGE: &str = "ACK";
const RESPONSE_FAILURE: &str = "ERR";
const RESPONSE_INTERRUPT: &str = "ALERT";

/// A decoded PMC frame: an upper-cased response code and an optional
/// argument (the part after the first `=`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Response code, upper-cased and stripped.
    pub code: String,
    /// Response argument, stripped; `None` when the frame carried no `=`.
    pub value: Option<String>,
}

/// Semantic classification of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Setter acknowledgement.
    Ack,
    /// Command rejection.
    Err,
    /// Unsolicited interrupt notification.
    Alert,
    /// Getter response (`CODE=VALUE`) or out-of-sequence data.
    Data,
}

impl Frame {
    /// Classify the frame by its response code.
    pub fn kind(&self) -> FrameKind {
        match self.code.as_str() {
            RESPONSE_ACKNOWLEDGE => FrameKind::Ack,
            RESPONSE_FAILURE => FrameKind::Err,
            RESPONSE_INTERRUPT => FrameKind::Alert,
            _ => FrameKind::Data,
        }
    }
}

fn strip(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !STRIP.contains(b))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !STRIP.contains(b))
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Decode a raw frame (terminator already removed).
///
/// Returns `None` for frames that are empty after stripping; the PMC emits
/// those between responses and they carry no information. Non-ASCII bytes
/// are dropped, mirroring the tolerant decoding of the vendor firmware.
pub fn decode(raw: &[u8]) -> Option<Frame> {
    let body: String = strip(raw)
        .iter()
        .copied()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect();
    if body.is_empty() {
        return None;
    }
    match body.split_once('=') {
        Some((code, value)) => Some(Frame {
            code: code.trim_matches([' ', '\n', '\t']).to_ascii_uppercase(),
            value: Some(value.trim_matches([' ', '\n', '\t']).to_string()),
        }),
        None => Some(Frame {
            code: body.to_ascii_uppercase(),
            value: None,
        }),
    }
}

/// Encode a command into its wire representation, terminator included.
pub fn encode(code: &str, value: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(code.len() + 20);
    out.extend_from_slice(code.as_bytes());
    if let Some(value) = value {
        out.push(b'=');
        out.extend(value.bytes().filter(u8::is_ascii));
    }
    out.push(TERMINATOR);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_getter_response() {
        let frame = decode(b"VER=WD BBC v02").expect("frame");
        assert_eq!(frame.code, "VER");
        assert_eq!(frame.value.as_deref(), Some("WD BBC v02"));
        assert_eq!(frame.kind(), FrameKind::Data);
    }

    #[test]
    fn decode_strips_surrounding_whitespace() {
        let frame = decode(b" \n\tISR=10 \t").expect("frame");
        assert_eq!(frame.code, "ISR");
        assert_eq!(frame.value.as_deref(), Some("10"));
    }

    #[test]
    fn decode_classifies_keywords() {
        assert_eq!(decode(b"ACK").expect("frame").kind(), FrameKind::Ack);
        assert_eq!(decode(b"ERR").expect("frame").kind(), FrameKind::Err);
        assert_eq!(decode(b"ALERT").expect("frame").kind(), FrameKind::Alert);
    }

    #[test]
    fn decode_upper_cases_codes() {
        let frame = decode(b"alert").expect("frame");
        assert_eq!(frame.kind(), FrameKind::Alert);
    }

    #[test]
    fn empty_frames_are_discarded() {
        assert_eq!(decode(b""), None);
        assert_eq!(decode(b" \n\t"), None);
    }

    #[test]
    fn encode_appends_terminator() {
        assert_eq!(encode("FAN", Some("37")), b"FAN=37\r");
        assert_eq!(encode("ISR", None), b"ISR\r");
    }

    #[test]
    fn encode_drops_non_ascii() {
        assert_eq!(encode("LN1", Some("caf\u{e9}")), b"LN1=caf\r");
    }
}
