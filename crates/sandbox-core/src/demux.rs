//! Container log stream demultiplexing
//!
//! With TTY disabled the engine interleaves stdout and stderr in a single
//! stream of frames:
//!
//! ```text
//! [stream:u8][0u8; 3][len:u32 big-endian][payload; len]
//! ```
//!
//! Stream 1 is stdout, 2 is stderr; other stream ids are skipped.

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Split a multiplexed log buffer into trimmed stdout and stderr text.
///
/// Parsing stops once fewer than `HEADER_LEN` bytes remain. A payload cut
/// short by the end of the buffer contributes whatever bytes are present.
pub fn demux(raw: &[u8]) -> DemuxedOutput {
    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();

    let mut offset = 0usize;
    while raw.len() - offset >= HEADER_LEN {
        let header = &raw[offset..offset + HEADER_LEN];
        let stream = header[0];
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let start = offset + HEADER_LEN;
        let end = start.saturating_add(size).min(raw.len());
        let payload = &raw[start..end];

        match stream {
            1 => stdout.extend_from_slice(payload),
            2 => stderr.extend_from_slice(payload),
            _ => {}
        }

        offset = end;
    }

    DemuxedOutput {
        stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
    }
}

/// Append one frame in the engine's multiplexed format.
pub fn encode_frame(kind: StreamKind, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(HEADER_LEN + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_frames() {
        let mut raw = Vec::new();
        encode_frame(StreamKind::Stdout, b"  hello ", &mut raw);
        encode_frame(StreamKind::Stderr, b"warn: x\n", &mut raw);
        encode_frame(StreamKind::Stdout, b"world\n", &mut raw);
        encode_frame(StreamKind::Stderr, b"warn: y\n\n", &mut raw);

        let out = demux(&raw);
        assert_eq!(out.stdout, "hello world");
        assert_eq!(out.stderr, "warn: x\nwarn: y");
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let raw = [1u8, 0, 0, 0, 0, 0, 0, 3, b'a', b'b', b'c'];
        assert_eq!(demux(&raw).stdout, "abc");

        let mut encoded = Vec::new();
        encode_frame(StreamKind::Stderr, &[b'x'; 258], &mut encoded);
        assert_eq!(&encoded[..8], &[2, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_unknown_stream_ids_are_ignored() {
        let mut raw = Vec::new();
        encode_frame(StreamKind::Stdin, b"ignored", &mut raw);
        raw.extend_from_slice(&[7, 0, 0, 0, 0, 0, 0, 2, b'z', b'z']);
        encode_frame(StreamKind::Stdout, b"kept", &mut raw);

        let out = demux(&raw);
        assert_eq!(out.stdout, "kept");
        assert_eq!(out.stderr, "");
    }

    #[test]
    fn test_truncated_trailing_header_ends_stream() {
        let mut raw = Vec::new();
        encode_frame(StreamKind::Stdout, b"done", &mut raw);
        raw.extend_from_slice(&[1, 0, 0, 0, 0]);

        assert_eq!(demux(&raw).stdout, "done");
        assert_eq!(demux(&[]), DemuxedOutput::default());
        assert_eq!(demux(&[1, 0, 0]), DemuxedOutput::default());
    }

    #[test]
    fn test_short_payload_takes_available_bytes() {
        let raw = [2u8, 0, 0, 0, 0, 0, 0, 10, b'o', b'o', b'p', b's'];
        assert_eq!(demux(&raw).stderr, "oops");
    }

    #[test]
    fn test_multibyte_text_split_across_frames() {
        let text = "héllo";
        let bytes = text.as_bytes();
        let mut raw = Vec::new();
        encode_frame(StreamKind::Stdout, &bytes[..2], &mut raw);
        encode_frame(StreamKind::Stdout, &bytes[2..], &mut raw);
        assert_eq!(demux(&raw).stdout, text);
    }
}
