//! HTTP/1.x message heads and body framing for the relay
//!
//! Heads are parsed into [`RequestHead`] / [`ResponseHead`], bodies are read
//! chunk by chunk through [`BodyDecoder`] and re-emitted with the same framing
//! by [`write_body_chunk`] and [`finish_body`].
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted request or response head.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
  /// method
  pub method: Method,
  /// request target as sent: origin-form, absolute-form or authority-form
  pub target: String,
  /// protocol version
  pub version: Version,
  /// headers in wire order
  pub headers: HeaderMap,
  /// bytes the head occupied on the wire
  pub head_size: usize,
}

/// Parsed status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
  /// protocol version
  pub version: Version,
  /// status
  pub status: StatusCode,
  /// reason phrase as sent
  pub reason: String,
  /// headers in wire order
  pub headers: HeaderMap,
  /// bytes the head occupied on the wire
  pub head_size: usize,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// no body
  Empty,
  /// `Content-Length`
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// read until the peer closes
  UntilClose,
}

/// Read one line of at most `limit` bytes, newline included. Longer lines
/// are rejected after reading `limit + 1` bytes.
async fn read_bounded_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize, what: &str) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = (&mut *reader)
    .take(limit as u64 + 1)
    .read_until(b'\n', line)
    .await?;
  if n > limit {
    return Err(Error::invalid_request(format!("{} too large", what)));
  }
  Ok(n)
}

async fn read_head_lines<R>(reader: &mut R) -> Result<Option<(Vec<Vec<u8>>, usize)>>
where
  R: AsyncBufRead + Unpin,
{
  let mut lines = Vec::new();
  let mut size = 0;
  loop {
    let mut line = Vec::new();
    let n = read_bounded_line(reader, &mut line, MAX_HEAD_SIZE - size, "message head").await?;
    if n == 0 {
      if size == 0 {
        return Ok(None);
      }
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated message head"));
    }
    size += n;
    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    if trimmed.is_empty() {
      // stray CRLF before the start line is tolerated
      if lines.is_empty() {
        continue;
      }
      return Ok(Some((lines, size)));
    }
    lines.push(trimmed.to_vec());
  }
}

fn parse_headers(lines: &[Vec<u8>]) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for line in lines {
    if let Ok((Some(k), Some(v))) = parser_header(line) {
      headers.append(k, v);
    }
  }
  headers
}

fn parser_header(buffer: &[u8]) -> Result<(Option<HeaderName>, Option<HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    match index {
      0 => k = Some(HeaderName::from_bytes(h).map_err(http::Error::from)?),
      1 => v = Some(HeaderValue::from_bytes(h.trim_ascii()).map_err(http::Error::from)?),
      _ => {}
    }
  }
  Ok((k, v))
}

fn parse_version(raw: &[u8]) -> Result<Version> {
  match raw {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request(format!(
      "unsupported http version {}",
      String::from_utf8_lossy(raw)
    ))),
  }
}

/// Text form used on the wire and in captured entries.
pub(crate) fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else if version == Version::HTTP_09 {
    "HTTP/0.9"
  } else {
    "HTTP/1.1"
  }
}

impl RequestHead {
  /// Read the next request head. `Ok(None)` on clean EOF before any byte.
  pub async fn read<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
    let Some((lines, head_size)) = read_head_lines(reader).await? else {
      return Ok(None);
    };
    let mut parts = lines[0].split(|b| *b == b' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
      return Err(Error::invalid_request("malformed request line"));
    };
    let method =
      Method::from_bytes(method).map_err(|_| Error::invalid_request("invalid request method"))?;
    let target = String::from_utf8(target.to_vec())
      .map_err(|_| Error::invalid_request("request target is not valid UTF-8"))?;
    Ok(Some(RequestHead {
      method,
      target,
      version: parse_version(version)?,
      headers: parse_headers(&lines[1..]),
      head_size,
    }))
  }

  /// Serialize the head.
  pub fn to_raw(&self) -> Vec<u8> {
    let mut raw = Vec::with_capacity(self.head_size.max(128));
    raw.extend(self.method.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.target.as_bytes());
    raw.extend(SPACE);
    raw.extend(version_str(self.version).as_bytes());
    raw.extend(CR_LF);
    write_headers(&mut raw, &self.headers);
    raw
  }

  /// Body framing of this request.
  pub fn framing(&self) -> Result<BodyFraming> {
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(&self.headers)? {
      Some(0) | None => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
    }
  }

  /// Whether the client allows the connection to be reused.
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

impl ResponseHead {
  /// Read the next response head. `Ok(None)` on clean EOF before any byte.
  pub async fn read<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
    let Some((lines, head_size)) = read_head_lines(reader).await? else {
      return Ok(None);
    };
    let mut parts = lines[0].splitn(3, |b| *b == b' ');
    let version = parse_version(parts.next().unwrap_or_default())?;
    let status = parts
      .next()
      .and_then(|code| StatusCode::from_bytes(code).ok())
      .ok_or_else(|| Error::invalid_request("malformed status line"))?;
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).into_owned())
      .unwrap_or_default();
    Ok(Some(ResponseHead {
      version,
      status,
      reason,
      headers: parse_headers(&lines[1..]),
      head_size,
    }))
  }

  /// Serialize the head.
  pub fn to_raw(&self) -> Vec<u8> {
    let mut raw = Vec::with_capacity(self.head_size.max(128));
    raw.extend(version_str(self.version).as_bytes());
    raw.extend(SPACE);
    raw.extend(self.status.as_str().as_bytes());
    raw.extend(SPACE);
    raw.extend(self.reason.as_bytes());
    raw.extend(CR_LF);
    write_headers(&mut raw, &self.headers);
    raw
  }

  /// Body framing of this response to a request made with `method`.
  pub fn framing(&self, method: &Method) -> Result<BodyFraming> {
    if method == Method::HEAD
      || self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED
    {
      return Ok(BodyFraming::Empty);
    }
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    match content_length(&self.headers)? {
      Some(0) => Ok(BodyFraming::Empty),
      Some(n) => Ok(BodyFraming::Length(n)),
      None => Ok(BodyFraming::UntilClose),
    }
  }

  /// Whether the server allows the connection to be reused.
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }

  /// Reason phrase, falling back to the canonical one.
  pub fn status_text(&self) -> String {
    if self.reason.is_empty() {
      self.status.canonical_reason().unwrap_or_default().to_string()
    } else {
      self.reason.clone()
    }
  }
}

fn write_headers(raw: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| Error::invalid_request("invalid content-length")),
  }
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let tokens = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase());
  let (mut close, mut alive) = (false, false);
  for token in tokens {
    close |= token == "close";
    alive |= token == "keep-alive";
  }
  if close {
    false
  } else {
    alive || version == Version::HTTP_11
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
  Size,
  Data(u64),
  Done,
}

/// Incremental body reader honoring a [`BodyFraming`].
#[derive(Debug)]
pub(crate) struct BodyDecoder {
  framing: BodyFraming,
  remaining: u64,
  chunk: ChunkState,
  wire_bytes: u64,
}

impl BodyDecoder {
  pub(crate) fn new(framing: BodyFraming) -> Self {
    let remaining = match framing {
      BodyFraming::Length(n) => n,
      _ => 0,
    };
    BodyDecoder {
      framing,
      remaining,
      chunk: ChunkState::Size,
      wire_bytes: 0,
    }
  }

  /// Bytes consumed from the wire so far, chunk framing included.
  pub(crate) fn wire_bytes(&self) -> u64 {
    self.wire_bytes
  }

  /// Next piece of decoded body; `Ok(None)` once the body is complete.
  pub(crate) async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin,
  {
    match self.framing {
      BodyFraming::Empty => Ok(None),
      BodyFraming::Length(_) => {
        if self.remaining == 0 {
          return Ok(None);
        }
        let want = self.remaining.min(READ_CHUNK as u64) as usize;
        let data = self.read_some(reader, want).await?;
        if data.is_empty() {
          return Err(new_io_error(ErrorKind::UnexpectedEof, "body ended early"));
        }
        self.remaining -= data.len() as u64;
        Ok(Some(data))
      }
      BodyFraming::UntilClose => {
        let data = self.read_some(reader, READ_CHUNK).await?;
        Ok(if data.is_empty() { None } else { Some(data) })
      }
      BodyFraming::Chunked => self.next_chunked(reader).await,
    }
  }

  async fn read_some<R>(&mut self, reader: &mut R, want: usize) -> Result<Bytes>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut buf = vec![0; want];
    let n = reader.read(&mut buf).await?;
    buf.truncate(n);
    self.wire_bytes += n as u64;
    Ok(Bytes::from(buf))
  }

  async fn read_line<R>(&mut self, reader: &mut R) -> Result<Vec<u8>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut line = Vec::new();
    let n = read_bounded_line(reader, &mut line, MAX_HEAD_SIZE, "chunk header").await?;
    if n == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "chunked body ended early"));
    }
    self.wire_bytes += n as u64;
    Ok(line)
  }

  async fn next_chunked<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin,
  {
    loop {
      match self.chunk {
        ChunkState::Done => return Ok(None),
        ChunkState::Size => {
          let line = self.read_line(reader).await?;
          let text = String::from_utf8_lossy(&line);
          let size = text.split(';').next().unwrap_or_default().trim();
          let size = u64::from_str_radix(size, 16)
            .map_err(|_| Error::invalid_request(format!("invalid chunk size {:?}", size)))?;
          if size == 0 {
            // trailers end with an empty line
            loop {
              let trailer = self.read_line(reader).await?;
              if trailer == b"\r\n" || trailer == b"\n" {
                break;
              }
            }
            self.chunk = ChunkState::Done;
          } else {
            self.chunk = ChunkState::Data(size);
          }
        }
        ChunkState::Data(left) => {
          let want = left.min(READ_CHUNK as u64) as usize;
          let data = self.read_some(reader, want).await?;
          if data.is_empty() {
            return Err(new_io_error(ErrorKind::UnexpectedEof, "chunk ended early"));
          }
          let left = left - data.len() as u64;
          if left == 0 {
            self.read_line(reader).await?;
            self.chunk = ChunkState::Size;
          } else {
            self.chunk = ChunkState::Data(left);
          }
          return Ok(Some(data));
        }
      }
    }
  }
}

/// Write one piece of body using `framing`.
pub(crate) async fn write_body_chunk<W>(writer: &mut W, framing: BodyFraming, data: &[u8]) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if data.is_empty() {
    return Ok(());
  }
  if framing == BodyFraming::Chunked {
    writer
      .write_all(format!("{:x}\r\n", data.len()).as_bytes())
      .await?;
    writer.write_all(data).await?;
    writer.write_all(CR_LF).await?;
  } else {
    writer.write_all(data).await?;
  }
  Ok(())
}

/// Terminate a body written with `framing` and flush.
pub(crate) async fn finish_body<W>(writer: &mut W, framing: BodyFraming) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if framing == BodyFraming::Chunked {
    writer.write_all(b"0\r\n\r\n").await?;
  }
  writer.flush().await?;
  Ok(())
}

/// Bounded copy of a body kept for capture.
#[derive(Debug, Default)]
pub(crate) struct BodySink {
  data: Vec<u8>,
  limit: usize,
  total: u64,
}

impl BodySink {
  pub(crate) fn new(limit: usize) -> Self {
    BodySink {
      data: Vec::new(),
      limit,
      total: 0,
    }
  }

  pub(crate) fn push(&mut self, chunk: &[u8]) {
    self.total += chunk.len() as u64;
    let room = self.limit.saturating_sub(self.data.len());
    self.data.extend_from_slice(&chunk[..room.min(chunk.len())]);
  }

  /// Total bytes seen, kept or not.
  pub(crate) fn total(&self) -> u64 {
    self.total
  }

  /// `true` when bytes were dropped.
  pub(crate) fn overflowed(&self) -> bool {
    self.total > self.data.len() as u64
  }

  pub(crate) fn data(&self) -> &[u8] {
    &self.data
  }
}

/// Minimal response generated by the proxy itself.
pub(crate) fn error_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    status,
    reason,
    message.len(),
    message
  )
  .into_bytes()
}

/// Content coding of a message, lowercased; `None` for identity.
pub(crate) fn content_encoding(headers: &HeaderMap) -> Option<String> {
  headers
    .get(http::header::CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase())
    .filter(|v| !v.is_empty() && v != "identity")
}

/// Undo the content coding of a complete body. `None` when the coding is
/// not supported or the data is corrupt.
pub(crate) fn decode_content(headers: &HeaderMap, data: &[u8]) -> Option<Vec<u8>> {
  match content_encoding(headers).as_deref() {
    None => Some(data.to_vec()),
    #[cfg(feature = "gzip")]
    Some("gzip") | Some("x-gzip") => {
      use std::io::Read;
      let mut decoded = Vec::new();
      flate2::read::MultiGzDecoder::new(data)
        .read_to_end(&mut decoded)
        .ok()?;
      Some(decoded)
    }
    #[cfg(feature = "gzip")]
    Some("deflate") => {
      use std::io::Read;
      let mut decoded = Vec::new();
      if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut decoded)
        .is_ok()
      {
        return Some(decoded);
      }
      decoded.clear();
      flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .ok()?;
      Some(decoded)
    }
    Some(_) => None,
  }
}
