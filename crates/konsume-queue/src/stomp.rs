//! Minimal STOMP 1.2 framing over a tokio-util codec.
//!
//! Covers the client subset the ActiveMQ adapter needs: CONNECT/CONNECTED,
//! SUBSCRIBE/UNSUBSCRIBE, MESSAGE, ERROR and DISCONNECT. Bodies are
//! delimited by `content-length` when the broker provides it, otherwise by
//! the NUL terminator. Bare EOLs between frames (heart-beats) are skipped.
//! Header octet escaping is not implemented; the headers this client sends
//! and reads contain no characters that require it.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub struct StompCodec;

impl Encoder<Frame> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            dst.put_slice(name.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        // Heart-beats arrive as bare EOLs between frames.
        while src.first().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            src.advance(1);
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Header block ends at the first blank line.
        let lf = find_bytes(src, b"\n\n").map(|i| (i, 2));
        let crlf = find_bytes(src, b"\n\r\n").map(|i| (i, 3));
        let (header_end, separator_len) = match (lf, crlf) {
            (Some(a), Some(b)) => std::cmp::min_by_key(a, b, |(i, _)| *i),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return Ok(None),
        };

        let header_block = String::from_utf8_lossy(&src[..header_end]).into_owned();
        let mut lines = header_block.lines().map(|l| l.trim_end_matches('\r'));
        let command = match lines.next() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "empty command")),
        };
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let body_start = header_end + separator_len;
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok());

        let (body, frame_end) = match content_length {
            Some(len) => {
                // Body plus the NUL terminator must be buffered.
                if src.len() < body_start + len + 1 {
                    return Ok(None);
                }
                (src[body_start..body_start + len].to_vec(), body_start + len)
            }
            None => match find_bytes(&src[body_start..], &[0]) {
                Some(z) => (
                    src[body_start..body_start + z].to_vec(),
                    body_start + z,
                ),
                None => return Ok(None),
            },
        };

        src.advance(frame_end + 1);
        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}
