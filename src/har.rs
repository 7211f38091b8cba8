//! HAR 1.2 document model
//!
//! Entries never store their total `time`: it is derived from [`Timings`]
//! whenever an entry is serialized or queried.
use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;

/// HAR format version written by [`Har::new`].
pub const HAR_VERSION: &str = "1.2";

/// Root HAR document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
  /// log
  pub log: Log,
}

impl Har {
  /// Build a document with this crate as creator.
  pub fn new(pages: Vec<Page>, entries: Vec<Entry>) -> Self {
    Har {
      log: Log {
        version: HAR_VERSION.to_string(),
        creator: Creator {
          name: env!("CARGO_PKG_NAME").to_string(),
          version: env!("CARGO_PKG_VERSION").to_string(),
          comment: None,
        },
        browser: None,
        pages,
        entries,
        comment: None,
      },
    }
  }

  /// Serialize as pretty printed JSON.
  pub fn to_json_pretty(&self) -> Result<String> {
    serde_json::to_string_pretty(self).map_err(|e| Error::export(e.to_string()))
  }

  /// Parse a HAR document.
  pub fn from_json(text: &str) -> Result<Self> {
    serde_json::from_str(text).map_err(|e| Error::import(e.to_string()))
  }
}

/// The `log` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
  /// format version
  pub version: String,
  /// producing application
  pub creator: Creator,
  /// browser, when known
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub browser: Option<Creator>,
  /// pages
  #[serde(default)]
  pub pages: Vec<Page>,
  /// entries
  #[serde(default)]
  pub entries: Vec<Entry>,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// `creator` and `browser` objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
  /// name
  pub name: String,
  /// version
  pub version: String,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// A group of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
  /// page start
  #[serde(with = "time::serde::rfc3339")]
  pub started_date_time: OffsetDateTime,
  /// unique id referenced by `Entry::pageref`
  pub id: String,
  /// title
  pub title: String,
  /// page timings
  #[serde(default)]
  pub page_timings: PageTimings,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// Page load aggregates in milliseconds, `-1` when unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
  /// DOMContentLoaded
  #[serde(default, with = "optional_millis")]
  pub on_content_load: Option<f64>,
  /// load
  #[serde(default, with = "optional_millis")]
  pub on_load: Option<f64>,
}

/// One recorded transaction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
  /// owning page
  #[serde(default)]
  pub pageref: Option<String>,
  /// transaction start
  #[serde(with = "time::serde::rfc3339")]
  pub started_date_time: OffsetDateTime,
  /// request
  pub request: Request,
  /// response; status `0` plus `_error` on failure
  pub response: Response,
  /// cache state, always empty
  #[serde(default)]
  pub cache: Cache,
  /// phase timings
  pub timings: Timings,
  /// upstream address
  #[serde(default, rename = "serverIPAddress")]
  pub server_ip_address: Option<String>,
  /// connection id
  #[serde(default)]
  pub connection: Option<String>,
  /// comment
  #[serde(default)]
  pub comment: Option<String>,
}

impl Entry {
  /// Total elapsed time: the sum of every phase that was measured.
  pub fn time(&self) -> f64 {
    self.timings.total()
  }

  /// `true` when the transaction ended without a response.
  pub fn is_failure(&self) -> bool {
    self.response.error.is_some()
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryView<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pageref: Option<&'a String>,
  #[serde(with = "time::serde::rfc3339")]
  started_date_time: OffsetDateTime,
  time: f64,
  request: &'a Request,
  response: &'a Response,
  cache: &'a Cache,
  timings: &'a Timings,
  #[serde(rename = "serverIPAddress", skip_serializing_if = "Option::is_none")]
  server_ip_address: Option<&'a String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  connection: Option<&'a String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  comment: Option<&'a String>,
}

impl Serialize for Entry {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    EntryView {
      pageref: self.pageref.as_ref(),
      started_date_time: self.started_date_time,
      time: self.time(),
      request: &self.request,
      response: &self.response,
      cache: &self.cache,
      timings: &self.timings,
      server_ip_address: self.server_ip_address.as_ref(),
      connection: self.connection.as_ref(),
      comment: self.comment.as_ref(),
    }
    .serialize(serializer)
  }
}

/// Recorded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
  /// method
  pub method: String,
  /// absolute URL
  pub url: String,
  /// e.g. `HTTP/1.1`
  pub http_version: String,
  /// cookies
  #[serde(default)]
  pub cookies: Vec<Cookie>,
  /// headers in wire order
  #[serde(default)]
  pub headers: Vec<Header>,
  /// decoded query parameters
  #[serde(default)]
  pub query_string: Vec<QueryParam>,
  /// request body
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_data: Option<PostData>,
  /// head size in bytes, `-1` when unknown
  pub headers_size: i64,
  /// body size in bytes, `-1` when unknown
  pub body_size: i64,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// Recorded response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
  /// status code, `0` on failure
  pub status: u16,
  /// reason phrase
  pub status_text: String,
  /// e.g. `HTTP/1.1`
  pub http_version: String,
  /// cookies from `Set-Cookie`
  #[serde(default)]
  pub cookies: Vec<Cookie>,
  /// headers in wire order
  #[serde(default)]
  pub headers: Vec<Header>,
  /// body
  pub content: Content,
  /// `Location` target
  #[serde(default, rename = "redirectURL")]
  pub redirect_url: String,
  /// head size in bytes, `-1` when unknown
  pub headers_size: i64,
  /// body size in bytes, `-1` when unknown
  pub body_size: i64,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
  /// failure description
  #[serde(default, rename = "_error", skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Response {
  /// Placeholder for a transaction that produced no response.
  pub fn failed(message: impl Into<String>) -> Self {
    Response {
      status: 0,
      status_text: String::new(),
      http_version: String::new(),
      cookies: Vec::new(),
      headers: Vec::new(),
      content: Content::default(),
      redirect_url: String::new(),
      headers_size: -1,
      body_size: -1,
      comment: None,
      error: Some(message.into()),
    }
  }
}

/// Cookie record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
  /// name
  pub name: String,
  /// value
  pub value: String,
  /// path
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// domain
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
  /// expiry, ISO 8601
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<String>,
  /// HttpOnly
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub http_only: Option<bool>,
  /// Secure
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secure: Option<bool>,
}

/// Header name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
  /// name
  pub name: String,
  /// value
  pub value: String,
}

/// Query string parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
  /// name
  pub name: String,
  /// value
  pub value: String,
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
  /// mime type
  pub mime_type: String,
  /// form parameters
  #[serde(default)]
  pub params: Vec<Param>,
  /// body text
  #[serde(default)]
  pub text: String,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// Posted form parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
  /// name
  pub name: String,
  /// value
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  /// uploaded file name
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file_name: Option<String>,
  /// uploaded file content type
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
}

/// Response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
  /// decoded length in bytes
  pub size: i64,
  /// bytes saved by content encoding
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub compression: Option<i64>,
  /// mime type
  #[serde(default)]
  pub mime_type: String,
  /// body text or base64 payload
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  /// `base64` for binary payloads
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub encoding: Option<String>,
  /// comment
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// Cache state. The proxy never serves from cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {}

/// Phase timings in milliseconds.
///
/// Phases that did not apply serialize as `-1` and are excluded from
/// [`Timings::total`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
  /// waiting for a connection
  #[serde(default, with = "optional_millis")]
  pub blocked: Option<f64>,
  /// DNS resolution
  #[serde(default, with = "optional_millis")]
  pub dns: Option<f64>,
  /// TCP connect
  #[serde(default, with = "optional_millis")]
  pub connect: Option<f64>,
  /// TLS handshake
  #[serde(default, with = "optional_millis")]
  pub ssl: Option<f64>,
  /// sending the request
  #[serde(default, with = "optional_millis")]
  pub send: Option<f64>,
  /// waiting for the first response byte
  #[serde(default, with = "optional_millis")]
  pub wait: Option<f64>,
  /// reading the response
  #[serde(default, with = "optional_millis")]
  pub receive: Option<f64>,
}

impl Timings {
  /// Sum of every measured phase.
  pub fn total(&self) -> f64 {
    [
      self.blocked,
      self.dns,
      self.connect,
      self.ssl,
      self.send,
      self.wait,
      self.receive,
    ]
    .iter()
    .flatten()
    .sum()
  }
}

mod optional_millis {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(ms) if *ms >= 0.0 => serializer.serialize_f64(*ms),
      _ => serializer.serialize_f64(-1.0),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|ms| *ms >= 0.0))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(timings: Timings) -> Entry {
    Entry {
      pageref: Some("page_1".to_string()),
      started_date_time: OffsetDateTime::UNIX_EPOCH,
      request: Request {
        method: "GET".to_string(),
        url: "https://example.com/".to_string(),
        http_version: "HTTP/1.1".to_string(),
        cookies: vec![],
        headers: vec![],
        query_string: vec![],
        post_data: None,
        headers_size: -1,
        body_size: 0,
        comment: None,
      },
      response: Response::failed("No response received"),
      cache: Cache::default(),
      timings,
      server_ip_address: None,
      connection: None,
      comment: None,
    }
  }

  #[test]
  fn time_is_sum_of_measured_phases() {
    let e = entry(Timings {
      blocked: None,
      dns: Some(2.0),
      connect: Some(3.5),
      ssl: None,
      send: Some(0.5),
      wait: Some(10.0),
      receive: Some(1.0),
    });
    assert_eq!(e.time(), 17.0);
    let json = serde_json::to_value(&e).unwrap();
    assert_eq!(json["time"], 17.0);
    assert_eq!(json["timings"]["ssl"], -1.0);
    assert_eq!(json["timings"]["blocked"], -1.0);
    assert_eq!(json["response"]["_error"], "No response received");
    assert_eq!(json["response"]["status"], 0);
  }

  #[test]
  fn sentinel_reads_back_as_absent() {
    let e = entry(Timings {
      dns: Some(1.25),
      send: Some(0.0),
      ..Default::default()
    });
    let text = serde_json::to_string(&e).unwrap();
    let back: Entry = serde_json::from_str(&text).unwrap();
    assert_eq!(back.timings.ssl, None);
    assert_eq!(back.timings.dns, Some(1.25));
    assert_eq!(back.time(), e.time());
  }

  #[test]
  fn document_parses() {
    let har = Har::new(vec![], vec![entry(Timings::default())]);
    let text = har.to_json_pretty().unwrap();
    assert!(text.contains("\"version\": \"1.2\""));
    assert_eq!(Har::from_json(&text).unwrap(), har);
    assert!(matches!(Har::from_json("{"), Err(Error::Import(_))));
  }
}
