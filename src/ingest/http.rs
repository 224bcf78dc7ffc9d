//! HTTP camera feed transport.
//!
//! Supports the two shapes public traffic cameras usually serve:
//! - `multipart/x-mixed-replace` MJPEG streams
//! - single JPEG snapshots (one image per GET)
//!
//! The content type of the GET response selects the shape on every `open`.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use url::Url;

use super::live::FeedTransport;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpFeed {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    /// Body of the snapshot fetched by `open`, if not yet consumed.
    SingleJpeg(Option<Vec<u8>>),
}

impl HttpFeed {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse feed url '{}'", url))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported feed scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(DEFAULT_READ_TIMEOUT)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            stream: None,
        })
    }
}

impl FeedTransport for HttpFeed {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn probe(&mut self, timeout: Duration) -> Result<()> {
        let probe = ureq::AgentBuilder::new().timeout(timeout).build();
        match probe.head(&self.url).call() {
            Ok(_) => Ok(()),
            // Some cameras reject HEAD but are serving.
            Err(ureq::Error::Status(405, _)) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("feed {} answered HTTP {}", self.url, code))
            }
            Err(e) => Err(anyhow!("feed {} unreachable: {}", self.url, e)),
        }
    }

    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to feed {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else {
            let mut bytes = Vec::new();
            response
                .into_reader()
                .take(MAX_JPEG_BYTES as u64)
                .read_to_end(&mut bytes)
                .context("read jpeg snapshot")?;
            self.stream = Some(HttpStream::SingleJpeg(Some(bytes)));
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("feed {} not open; call open() first", self.url))?;
        match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg().map(Some),
            HttpStream::SingleJpeg(pending) => match pending.take() {
                Some(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
                Some(_) => Ok(None),
                None => fetch_single_jpeg(&self.agent, &self.url),
            },
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Option<Vec<u8>>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// Locate the first complete SOI..EOI JPEG segment in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_complete_jpeg_segment() {
        let buffer = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&buffer), Some((1, 7)));
    }

    #[test]
    fn incomplete_segment_is_not_returned() {
        let buffer = [0xFF, 0xD8, 0x01, 0x02];
        assert_eq!(find_jpeg_bounds(&buffer), None);
    }

    #[test]
    fn mjpeg_stream_yields_consecutive_frames() -> Result<()> {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        body.extend_from_slice(b"\r\n--frame\r\n\r\n");
        body.extend_from_slice(&[0xFF, 0xD8, 0xBB, 0xBB, 0xFF, 0xD9]);

        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        assert_eq!(stream.read_next_jpeg()?, vec![0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);
        assert_eq!(
            stream.read_next_jpeg()?,
            vec![0xFF, 0xD8, 0xBB, 0xBB, 0xFF, 0xD9]
        );
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(HttpFeed::new("rtsp://camera/stream", Duration::from_secs(1)).is_err());
        assert!(HttpFeed::new("http://camera/stream", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn read_before_open_is_an_error() {
        let mut feed = HttpFeed::new("http://camera/stream", Duration::from_secs(1)).unwrap();
        assert!(feed.read_frame().is_err());
    }
}
