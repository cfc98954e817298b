//! Incremental reader for `multipart/x-mixed-replace` MJPEG bodies.

use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MjpegError {
    #[error("multipart response without a boundary parameter: {0}")]
    MissingBoundary(String),
    #[error("no frame boundary within {0} bytes")]
    FrameTooLarge(usize),
}

/// What an HTTP response body holds, judged from its `Content-Type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFormat {
    Multipart { boundary: String },
    SingleJpeg,
    Video,
    Other(String),
}

pub fn body_format(content_type: &str) -> Result<BodyFormat, MjpegError> {
    let lower = content_type.trim().to_ascii_lowercase();
    let mime = lower.split(';').next().unwrap_or("").trim();

    if mime.starts_with("multipart/") {
        return boundary_from_content_type(content_type)
            .map(|boundary| BodyFormat::Multipart { boundary })
            .ok_or_else(|| MjpegError::MissingBoundary(content_type.to_owned()));
    }
    if mime == "image/jpeg" || mime == "image/jpg" {
        return Ok(BodyFormat::SingleJpeg);
    }
    if mime.starts_with("video/")
        || mime == "application/vnd.apple.mpegurl"
        || mime == "application/x-mpegurl"
    {
        return Ok(BodyFormat::Video);
    }
    Ok(BodyFormat::Other(mime.to_owned()))
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(value.to_owned())
        }
    })
}

#[derive(Debug)]
pub struct MjpegParser {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched without finding what the pending
    /// part needs next.
    scanned: usize,
    max_frame_bytes: usize,
    closed: bool,
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        Self::with_limit(boundary, MAX_FRAME_BYTES)
    }

    pub fn with_limit(boundary: &str, max_frame_bytes: usize) -> Self {
        // Plenty of cameras declare the boundary with its leading dashes already
        // attached. Searching for the bare value still matches both forms.
        let delimiter = if boundary.starts_with("--") {
            boundary.as_bytes().to_vec()
        } else {
            format!("--{boundary}").into_bytes()
        };
        Self {
            delimiter,
            buffer: Vec::with_capacity(64 * 1024),
            scanned: 0,
            max_frame_bytes,
            closed: false,
        }
    }

    /// True once the closing delimiter (`--boundary--`) has been seen.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds the next body chunk and returns every JPEG part completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, MjpegError> {
        if self.closed {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = find(&self.buffer, &self.delimiter, 0) else {
                // Preamble or a delimiter cut in half: keep only what could
                // still grow into one.
                let keep = self.delimiter.len().min(self.buffer.len());
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
                break;
            };

            let headers_start = start + self.delimiter.len();
            if self.buffer.len() >= headers_start + 2
                && &self.buffer[headers_start..headers_start + 2] == b"--"
            {
                self.closed = true;
                self.buffer.clear();
                break;
            }

            let from = self.resume_from(headers_start, HEADER_END.len());
            let Some(header_end) = find(&self.buffer, HEADER_END, from) else {
                self.keep_from(start)?;
                self.scanned = self.buffer.len();
                break;
            };
            let body_start = header_end + HEADER_END.len();
            let content_length = parse_content_length(&self.buffer[headers_start..header_end]);

            let (body_end, consumed) = if let Some(len) = content_length {
                if len > self.max_frame_bytes {
                    return Err(MjpegError::FrameTooLarge(self.max_frame_bytes));
                }
                let end = body_start + len;
                if self.buffer.len() < end {
                    self.keep_from(start)?;
                    break;
                }
                (end, end)
            } else {
                let from = self.resume_from(body_start, self.delimiter.len());
                let Some(next) = find(&self.buffer, &self.delimiter, from) else {
                    self.keep_from(start)?;
                    self.scanned = self.buffer.len();
                    break;
                };
                (trim_trailing_crlf(&self.buffer, body_start, next), next)
            };

            let body = self.buffer[body_start..body_end].to_vec();
            self.buffer.drain(..consumed);
            self.scanned = 0;
            if !body.is_empty() {
                frames.push(body);
            }
        }

        Ok(frames)
    }

    /// Where to resume looking for `needle_len` bytes: the tail of the scanned
    /// prefix may hold a needle cut short by the previous chunk.
    fn resume_from(&self, from: usize, needle_len: usize) -> usize {
        from.max(self.scanned.saturating_sub(needle_len))
    }

    fn keep_from(&mut self, start: usize) -> Result<(), MjpegError> {
        self.buffer.drain(..start);
        self.scanned = 0;
        if self.buffer.len() > self.max_frame_bytes {
            return Err(MjpegError::FrameTooLarge(self.max_frame_bytes));
        }
        Ok(())
    }
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(headers);
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

fn trim_trailing_crlf(buffer: &[u8], start: usize, end: usize) -> usize {
    let mut end = end;
    while end > start && matches!(buffer[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    end
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::{BodyFormat, MjpegError, MjpegParser, body_format, boundary_from_content_type};

    fn part(body: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn content_type_boundary_is_extracted() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--myboundary\"")
                .as_deref(),
            Some("--myboundary")
        );
        assert_eq!(boundary_from_content_type("multipart/x-mixed-replace"), None);
    }

    #[test]
    fn body_formats_are_classified() {
        assert_eq!(
            body_format("multipart/x-mixed-replace; boundary=frame").unwrap(),
            BodyFormat::Multipart {
                boundary: "frame".to_owned()
            }
        );
        assert_eq!(body_format("image/jpeg").unwrap(), BodyFormat::SingleJpeg);
        assert_eq!(body_format("video/mp4").unwrap(), BodyFormat::Video);
        assert_eq!(
            body_format("application/vnd.apple.mpegURL").unwrap(),
            BodyFormat::Video
        );
        assert!(matches!(
            body_format("multipart/x-mixed-replace"),
            Err(MjpegError::MissingBoundary(_))
        ));
        assert_eq!(
            body_format("text/html; charset=utf-8").unwrap(),
            BodyFormat::Other("text/html".to_owned())
        );
    }

    #[test]
    fn frames_with_content_length_are_split() {
        let mut stream = part(b"\xFF\xD8first\xFF\xD9", true);
        stream.extend(part(b"\xFF\xD8second\xFF\xD9", true));

        let mut parser = MjpegParser::new("frame");
        let frames = parser.push(&stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"\xFF\xD8first\xFF\xD9");
        assert_eq!(frames[1], b"\xFF\xD8second\xFF\xD9");
    }

    #[test]
    fn frames_without_content_length_end_at_next_boundary() {
        let mut stream = part(b"one", false);
        stream.extend(part(b"two", false));

        let mut parser = MjpegParser::new("frame");
        let frames = parser.push(&stream).unwrap();
        // The last part has no following delimiter yet.
        assert_eq!(frames, vec![b"one".to_vec()]);

        let frames = parser.push(b"--frame\r\n").unwrap();
        assert_eq!(frames, vec![b"two".to_vec()]);
    }

    #[test]
    fn byte_by_byte_delivery_yields_same_frames() {
        let mut stream = b"preamble junk\r\n".to_vec();
        stream.extend(part(b"alpha", true));
        stream.extend(part(b"beta", true));

        let mut parser = MjpegParser::new("frame");
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(parser.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    }

    #[test]
    fn large_part_in_small_chunks_is_found_once_complete() {
        // Near-miss delimiters cross chunk edges all the way through.
        let mut body: Vec<u8> = b"--fram\r\n".repeat(8 * 1024);
        body.extend_from_slice(b"end");
        let mut stream = part(&body, false);
        stream.extend_from_slice(b"--frame\r\n");

        let mut parser = MjpegParser::new("frame");
        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            frames.extend(parser.push(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], body);
    }

    #[test]
    fn closing_delimiter_closes_the_parser() {
        let mut stream = part(b"last", true);
        stream.extend_from_slice(b"--frame--\r\n");
        let mut parser = MjpegParser::new("frame");
        assert_eq!(parser.push(&stream).unwrap(), vec![b"last".to_vec()]);
        assert!(parser.is_closed());
        assert!(parser.push(&part(b"ignored", true)).unwrap().is_empty());
    }

    #[test]
    fn oversized_parts_are_rejected() {
        let mut parser = MjpegParser::with_limit("frame", 8);
        let result = parser.push(&part(b"far too many bytes", true));
        assert_eq!(result, Err(MjpegError::FrameTooLarge(8)));
    }
}
