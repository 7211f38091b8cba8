//! Builds a capture entry while a transaction is in flight
use crate::capture::{CaptureType, CaptureTypes};
use crate::connector::ConnectTimings;
use crate::errors::Failure;
use crate::har::{self, Content, Cookie, Entry, Header, Param, PostData, QueryParam, Timings};
use crate::http::{content_encoding, decode_content, version_str, BodySink, RequestHead, ResponseHead};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
#[cfg(feature = "charset")]
use encoding_rs::{Encoding, UTF_8};
use http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, Method, Version};
use mime::Mime;
use percent_encoding::percent_decode_str;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Bytes of body kept per captured character of budget.
const BYTES_PER_CHAR: usize = 4;

/// Mutable view of an entry before it is finalized.
///
/// Hooks receive a shared reference at every stage of the transaction.
#[derive(Debug)]
pub struct EntryDraft {
  started: OffsetDateTime,
  clock: Instant,
  types: CaptureTypes,
  max_body_chars: usize,
  request: har::Request,
  response: Option<har::Response>,
  timings: Timings,
  server_ip: Option<IpAddr>,
  connection: Option<String>,
  comments: Vec<String>,
  send_started: Option<Instant>,
  request_sent: Option<Instant>,
  head_received: Option<Instant>,
}

impl EntryDraft {
  /// Start recording a transaction for `url`.
  pub fn new(
    method: &Method,
    url: impl Into<String>,
    version: Version,
    types: CaptureTypes,
    max_body_chars: usize,
  ) -> Self {
    let url = url.into();
    EntryDraft {
      started: OffsetDateTime::now_utc(),
      clock: Instant::now(),
      types,
      max_body_chars,
      request: har::Request {
        method: method.to_string(),
        query_string: parse_query(&url),
        url,
        http_version: version_str(version).to_string(),
        cookies: Vec::new(),
        headers: Vec::new(),
        post_data: None,
        headers_size: -1,
        body_size: -1,
        comment: None,
      },
      response: None,
      timings: Timings::default(),
      server_ip: None,
      connection: None,
      comments: Vec::new(),
      send_started: None,
      request_sent: None,
      head_received: None,
    }
  }

  /// Request URL.
  pub fn url(&self) -> &str {
    &self.request.url
  }

  /// Request method.
  pub fn method(&self) -> &str {
    &self.request.method
  }

  /// Response status once headers arrived.
  pub fn status(&self) -> Option<u16> {
    self.response.as_ref().map(|r| r.status)
  }

  /// Wall clock start.
  pub fn started(&self) -> OffsetDateTime {
    self.started
  }

  /// Time since the draft was created.
  pub fn elapsed(&self) -> Duration {
    self.clock.elapsed()
  }

  /// Bytes of body worth keeping for capture.
  pub(crate) fn body_capture_limit(&self, kind: CaptureType) -> usize {
    if self.types.contains(kind) {
      self.max_body_chars.saturating_mul(BYTES_PER_CHAR)
    } else {
      0
    }
  }

  pub(crate) fn record_request_head(&mut self, head: &RequestHead) {
    self.request.headers_size = head.head_size as i64;
    if self.types.contains(CaptureType::RequestHeaders) {
      self.request.headers = header_list(&head.headers);
    }
    if self.types.contains(CaptureType::RequestCookies) {
      self.request.cookies = request_cookies(&head.headers);
    }
  }

  /// Upstream connection details. `setup` is `None` for a reused connection.
  pub(crate) fn record_connection(
    &mut self,
    server_ip: IpAddr,
    connection: &str,
    setup: Option<&ConnectTimings>,
  ) {
    self.server_ip = Some(server_ip);
    self.connection = Some(connection.to_string());
    if let Some(setup) = setup {
      self.timings.dns = setup.dns.map(millis);
      self.timings.connect = setup.connect.map(millis);
      self.timings.ssl = setup.ssl.map(millis);
    }
  }

  pub(crate) fn begin_send(&mut self) {
    self.send_started = Some(Instant::now());
  }

  pub(crate) fn record_request_body(&mut self, head: &RequestHead, body: &BodySink) {
    let now = Instant::now();
    self.request_sent = Some(now);
    self.timings.send = self.send_started.map(|s| millis(now - s));
    self.request.body_size = body.total() as i64;
    if body.total() == 0 || !self.types.contains(CaptureType::RequestBody) {
      return;
    }
    let mime_type = header_str(&head.headers, CONTENT_TYPE).unwrap_or_default();
    let text = if body.overflowed() {
      truncation_marker(body.total(), self.max_body_chars)
    } else {
      let text = decode_text(body.data(), &mime_type);
      if text.chars().count() > self.max_body_chars {
        truncation_marker(body.total(), self.max_body_chars)
      } else {
        text
      }
    };
    let params = if mime_type.starts_with("application/x-www-form-urlencoded") && !body.overflowed() {
      parse_pairs(&text)
        .into_iter()
        .map(|(name, value)| Param {
          name,
          value: Some(value),
          file_name: None,
          content_type: None,
        })
        .collect()
    } else {
      Vec::new()
    };
    self.request.post_data = Some(PostData {
      mime_type,
      params,
      text,
      comment: None,
    });
  }

  pub(crate) fn record_response_head(&mut self, head: &ResponseHead) {
    let now = Instant::now();
    self.head_received = Some(now);
    self.timings.wait = self.request_sent.map(|s| millis(now - s));
    let mut response = har::Response {
      status: head.status.as_u16(),
      status_text: head.status_text(),
      http_version: version_str(head.version).to_string(),
      cookies: Vec::new(),
      headers: Vec::new(),
      content: Content {
        mime_type: header_str(&head.headers, CONTENT_TYPE).unwrap_or_default(),
        ..Default::default()
      },
      redirect_url: header_str(&head.headers, LOCATION).unwrap_or_default(),
      headers_size: head.head_size as i64,
      body_size: -1,
      comment: None,
      error: None,
    };
    if self.types.contains(CaptureType::ResponseHeaders) {
      response.headers = header_list(&head.headers);
    }
    if self.types.contains(CaptureType::ResponseCookies) {
      response.cookies = response_cookies(&head.headers);
    }
    self.response = Some(response);
  }

  /// Record the body as read from upstream. `wire_bytes` counts framing.
  pub(crate) fn record_response_body(&mut self, headers: &HeaderMap, body: &BodySink, wire_bytes: u64) {
    let now = Instant::now();
    self.timings.receive = self.head_received.map(|s| millis(now - s));
    let capture_body = self.types.contains(CaptureType::ResponseBody);
    let max_chars = self.max_body_chars;
    let Some(response) = self.response.as_mut() else {
      return;
    };
    response.body_size = wire_bytes as i64;
    let content = &mut response.content;
    content.size = body.total() as i64;
    if body.total() == 0 {
      return;
    }
    if body.overflowed() {
      if capture_body {
        content.text = Some(truncation_marker(body.total(), max_chars));
      }
      return;
    }
    let decoded = decode_content(headers, body.data());
    if let Some(decoded) = decoded.as_ref() {
      content.size = decoded.len() as i64;
      if content_encoding(headers).is_some() {
        content.compression = Some(body.total() as i64 - decoded.len() as i64);
      }
    }
    if !capture_body {
      return;
    }
    let data = decoded.as_deref().unwrap_or(body.data());
    let textual = decoded.is_some() && is_textual(&content.mime_type);
    let (text, encoding) = if textual {
      (decode_text(data, &content.mime_type), None)
    } else {
      (STANDARD.encode(data), Some("base64".to_string()))
    };
    if text.chars().count() > max_chars {
      content.text = Some(truncation_marker(content.size as u64, max_chars));
    } else {
      content.text = Some(text);
      content.encoding = encoding;
    }
  }

  /// Append a free-form note to the entry comment.
  pub fn note(&mut self, text: impl Into<String>) {
    self.comments.push(text.into());
  }

  fn comment(&self) -> Option<String> {
    if self.comments.is_empty() {
      None
    } else {
      Some(self.comments.join("; "))
    }
  }

  /// Finalize a completed transaction.
  pub fn finish(self) -> Entry {
    let comment = self.comment();
    let response = match self.response {
      Some(response) => response,
      None => har::Response::failed(Failure::NoResponse.to_string()),
    };
    Entry {
      pageref: None,
      started_date_time: self.started,
      request: self.request,
      response,
      cache: Default::default(),
      timings: self.timings,
      server_ip_address: self.server_ip.map(|ip| ip.to_string()),
      connection: self.connection,
      comment,
    }
  }

  /// Finalize a transaction that ended without a complete response.
  pub fn fail(mut self, failure: &Failure) -> Entry {
    if let Some(status) = self.status() {
      self.note(format!("failed after receiving status {}", status));
    }
    if self.timings.send.is_none() && self.send_started.is_none() {
      // nothing was sent: the whole elapsed time went to setup
      self.timings.blocked = Some(millis(self.clock.elapsed()));
    }
    self.response = Some(har::Response::failed(failure.to_string()));
    self.finish()
  }
}

fn millis(duration: Duration) -> f64 {
  duration.as_secs_f64() * 1000.0
}

/// Replacement text for a body larger than the capture limit.
pub(crate) fn truncation_marker(size: u64, max_chars: usize) -> String {
  format!(
    "[body omitted: {} bytes exceeds the capture limit of {} characters]",
    size, max_chars
  )
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
  headers
    .get(name)
    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

fn header_list(headers: &HeaderMap) -> Vec<Header> {
  headers
    .iter()
    .map(|(k, v)| Header {
      name: k.as_str().to_string(),
      value: String::from_utf8_lossy(v.as_bytes()).into_owned(),
    })
    .collect()
}

fn request_cookies(headers: &HeaderMap) -> Vec<Cookie> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(cookie::Cookie::split_parse)
    .filter_map(|c| c.ok())
    .map(|c| Cookie {
      name: c.name().to_string(),
      value: c.value().to_string(),
      path: None,
      domain: None,
      expires: None,
      http_only: None,
      secure: None,
    })
    .collect()
}

fn response_cookies(headers: &HeaderMap) -> Vec<Cookie> {
  headers
    .get_all(SET_COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .filter_map(|v| cookie::Cookie::parse(v).ok())
    .map(|c| Cookie {
      name: c.name().to_string(),
      value: c.value().to_string(),
      path: c.path().map(str::to_string),
      domain: c.domain().map(str::to_string),
      expires: c.expires_datetime().and_then(|t| t.format(&Rfc3339).ok()),
      http_only: c.http_only(),
      secure: c.secure(),
    })
    .collect()
}

fn decode_component(raw: &str) -> String {
  let raw = raw.replace('+', " ");
  percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}

fn parse_pairs(raw: &str) -> Vec<(String, String)> {
  raw
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| match pair.split_once('=') {
      Some((name, value)) => (decode_component(name), decode_component(value)),
      None => (decode_component(pair), String::new()),
    })
    .collect()
}

fn parse_query(url: &str) -> Vec<QueryParam> {
  let without_fragment = url.split('#').next().unwrap_or_default();
  let Some((_, query)) = without_fragment.split_once('?') else {
    return Vec::new();
  };
  parse_pairs(query)
    .into_iter()
    .map(|(name, value)| QueryParam { name, value })
    .collect()
}

fn is_textual(content_type: &str) -> bool {
  let Ok(mime) = content_type.parse::<Mime>() else {
    // no declared type: try text
    return content_type.is_empty();
  };
  mime.type_() == mime::TEXT
    || matches!(
      mime.subtype().as_str(),
      "json" | "xml" | "javascript" | "x-javascript" | "ecmascript" | "x-www-form-urlencoded" | "graphql"
    )
    || mime
      .suffix()
      .is_some_and(|s| s == mime::JSON || s == mime::XML)
}

#[cfg(feature = "charset")]
fn decode_text(data: &[u8], content_type: &str) -> String {
  let encoding = content_type
    .parse::<Mime>()
    .ok()
    .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()))
    .and_then(|label| Encoding::for_label(label.as_bytes()))
    .unwrap_or(UTF_8);
  let (text, _, _) = encoding.decode(data);
  text.into_owned()
}

#[cfg(not(feature = "charset"))]
fn decode_text(data: &[u8], _content_type: &str) -> String {
  String::from_utf8_lossy(data).into_owned()
}
