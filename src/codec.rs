//! Frame boundary detection for the `@Track` wire format, and synthesis of
//! the outbound ACK and AT-command frames.
//!
//! Inbound frames are ASCII, start with `+` and terminate at the first `$`.
//! There is no length prefix and no checksum verification; framing is purely
//! delimiter-based. A connection owns one [`FrameCodec`] and feeds it bytes
//! as they arrive; each call to [`FrameCodec::push`] may make zero or more
//! complete frames available via [`FrameCodec::next_frame`].

use chrono::{DateTime, Utc};
use std::fmt;

/// Frames are held in a per-connection buffer capped at 64 KiB. A device
/// that never sends `$` within this many bytes is assumed to be confused or
/// malicious; its buffer is dropped rather than grown without bound.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// The placeholder checksum every ACK frame carries. The device firmware in
/// this family does not verify it, but bit-exact compatibility requires
/// reproducing it verbatim rather than computing a real one.
pub const ACK_CHECKSUM: &str = "11F0";

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The buffer exceeded [`MAX_BUFFER_BYTES`] without a `$` terminator.
    /// The buffer has already been cleared by the time this is returned.
    #[error("frame buffer exceeded {MAX_BUFFER_BYTES} bytes without a terminator")]
    BufferOverflow,
}

/// Accumulates inbound bytes for one connection and yields complete frames.
#[derive(Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read bytes to the buffer. Returns an error (and clears
    /// the buffer) if doing so would exceed the hard cap without having
    /// found a terminator among the pending bytes.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFER_BYTES && !self.buf.contains(&b'$') {
            self.buf.clear();
            return Err(FramingError::BufferOverflow);
        }
        Ok(())
    }

    /// Extract the next complete frame, if any. Bytes preceding a `+` that
    /// is never followed by a terminating `$` are left in the buffer for
    /// the next call; bytes preceding a `+` that *is* eventually terminated
    /// are discarded as noise along with the frame itself.
    ///
    /// Non-ASCII bytes are tolerated: the frame slice is decoded as UTF-8
    /// when possible, falling back to a lossless Latin-1 decode (each byte
    /// maps directly to the Unicode code point of the same value).
    pub fn next_frame(&mut self) -> Option<String> {
        let dollar = self.buf.iter().position(|&b| b == b'$')?;
        let plus = self.buf[..dollar]
            .iter()
            .position(|&b| b == b'+')
            .unwrap_or(dollar);
        let frame_bytes: Vec<u8> = self.buf[plus..dollar].to_vec();
        self.buf.drain(..=dollar);
        if frame_bytes.is_empty() {
            return self.next_frame();
        }
        Some(decode_lossy(&frame_bytes))
    }

    /// Number of bytes currently buffered (partial frame data).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_lossy(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Which immobiliser state an outbound `GTOUT` command requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputBit {
    Block,
    Unblock,
}

impl fmt::Display for OutputBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputBit::Block => write!(f, "1"),
            OutputBit::Unblock => write!(f, "0"),
        }
    }
}

/// Synthesise the ACK frame for a parsed report.
///
/// `protocol_version` and `count` default to the values the original
/// implementation falls back to when a frame didn't carry them
/// (`090200` / `1`), so that a frame degenerate enough to miss those
/// positional fields still gets a well-formed ACK.
pub fn encode_ack(
    report_type: &str,
    protocol_version: Option<&str>,
    imei: &str,
    count: Option<u32>,
    now: DateTime<Utc>,
) -> String {
    let protocol_version = protocol_version.unwrap_or("090200");
    let count = count.unwrap_or(1);
    let timestamp = now.format("%Y%m%d%H%M%S");
    format!(
        "+ACK:{report_type},{protocol_version},{imei},,{count:04},{timestamp},{ACK_CHECKSUM}$"
    )
}

/// Synthesise the outbound `GTOUT` block/unblock command.
pub fn encode_gtout(password: &str, bit: OutputBit) -> String {
    format!("AT+GTOUT={password},{bit},,,,,,0,,,,,,,000{bit}$")
}

/// Synthesise the outbound `GTSRI` server-migration command.
pub fn encode_gtsri(
    password: &str,
    primary_ip: &str,
    primary_port: u16,
    backup_ip: &str,
    backup_port: u16,
) -> String {
    format!(
        "AT+GTSRI={password},3,,1,{primary_ip},{primary_port},{backup_ip},{backup_port},,60,0,0,0,,0,FFFF$"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn splits_single_frame() {
        let mut c = FrameCodec::new();
        c.push(b"+RESP:GTFRI,abc$").unwrap();
        assert_eq!(c.next_frame().as_deref(), Some("+RESP:GTFRI,abc"));
        assert_eq!(c.next_frame(), None);
    }

    #[test]
    fn assembles_frame_split_across_two_pushes() {
        let mut c = FrameCodec::new();
        c.push(b"+RESP:GT").unwrap();
        assert_eq!(c.next_frame(), None);
        c.push(b"FRI,abc$").unwrap();
        assert_eq!(c.next_frame().as_deref(), Some("+RESP:GTFRI,abc"));
    }

    #[test]
    fn two_frames_in_one_push_are_both_yielded_in_order() {
        let mut c = FrameCodec::new();
        c.push(b"+RESP:GTFRI,a$+RESP:GTIGN,b$").unwrap();
        assert_eq!(c.next_frame().as_deref(), Some("+RESP:GTFRI,a"));
        assert_eq!(c.next_frame().as_deref(), Some("+RESP:GTIGN,b"));
        assert_eq!(c.next_frame(), None);
    }

    #[test]
    fn discards_noise_before_a_plus() {
        let mut c = FrameCodec::new();
        c.push(b"garbage+RESP:GTFRI,a$").unwrap();
        assert_eq!(c.next_frame().as_deref(), Some("+RESP:GTFRI,a"));
    }

    #[test]
    fn buffer_overflow_without_terminator_clears_buffer() {
        let mut c = FrameCodec::new();
        let chunk = vec![b'x'; MAX_BUFFER_BYTES + 1];
        let err = c.push(&chunk).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow));
        assert_eq!(c.buffered_len(), 0);
    }

    #[test]
    fn non_ascii_bytes_decode_via_latin1_fallback() {
        let mut c = FrameCodec::new();
        let mut bytes = b"+RESP:GTFRI,".to_vec();
        bytes.push(0xE9); // Latin-1 'e acute', not valid standalone UTF-8
        bytes.extend_from_slice(b"$");
        c.push(&bytes).unwrap();
        let frame = c.next_frame().unwrap();
        assert!(frame.ends_with('\u{e9}'));
    }

    #[test]
    fn ack_has_bit_exact_shape() {
        let now = Utc.with_ymd_and_hms(2025, 7, 27, 12, 26, 5).unwrap();
        let ack = encode_ack("GTFRI", Some("090200"), "865083030049613", Some(1), now);
        assert_eq!(
            ack,
            "+ACK:GTFRI,090200,865083030049613,,0001,20250727122605,11F0$"
        );
    }

    #[test]
    fn gtout_block_command_shape() {
        let cmd = encode_gtout("gv50", OutputBit::Block);
        assert_eq!(cmd, "AT+GTOUT=gv50,1,,,,,,0,,,,,,,0001$");
    }

    #[test]
    fn gtout_unblock_command_shape() {
        let cmd = encode_gtout("gv50", OutputBit::Unblock);
        assert_eq!(cmd, "AT+GTOUT=gv50,0,,,,,,0,,,,,,,0000$");
    }

    #[test]
    fn gtsri_command_shape() {
        let cmd = encode_gtsri("gv50", "1.2.3.4", 8000, "5.6.7.8", 8001);
        assert_eq!(
            cmd,
            "AT+GTSRI=gv50,3,,1,1.2.3.4,8000,5.6.7.8,8001,,60,0,0,0,,0,FFFF$"
        );
    }
}
