//! Capture hooks and the pipeline that feeds them

use crate::capture::CaptureLog;
use crate::errors::Failure;
use crate::har::Entry;
use crate::record::EntryDraft;
use std::fmt;
use std::sync::Arc;

/// Observer of captured transactions.
///
/// Within one transaction the callbacks run in declaration order. Across
/// connections there is no ordering. Every method defaults to a no-op.
#[async_trait::async_trait]
pub trait CaptureHook: Send + Sync {
  /// A request line was read and a draft entry exists.
  async fn on_request_start(&self, _draft: &EntryDraft) {}

  /// The request head was recorded and forwarded upstream.
  async fn on_request_headers_complete(&self, _draft: &EntryDraft) {}

  /// The response head arrived.
  async fn on_response_headers_complete(&self, _draft: &EntryDraft) {}

  /// A piece of response body was relayed to the client.
  async fn on_response_body_chunk(&self, _draft: &EntryDraft, _chunk: &[u8]) {}

  /// The entry was finalized and appended to the log.
  async fn on_complete(&self, _entry: &Arc<Entry>) {}

  /// The transaction failed; `entry` carries status 0 and the error.
  async fn on_failure(&self, _entry: &Arc<Entry>, _failure: &Failure) {}
}

/// The capture log plus registered hooks.
#[derive(Clone)]
pub struct CapturePipeline {
  log: Arc<CaptureLog>,
  hooks: Vec<Arc<dyn CaptureHook>>,
}

impl fmt::Debug for CapturePipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CapturePipeline")
      .field("log", &self.log)
      .field("hooks", &self.hooks.len())
      .finish()
  }
}

impl CapturePipeline {
  /// Pipeline writing into `log`, with no hooks.
  pub fn new(log: Arc<CaptureLog>) -> Self {
    CapturePipeline {
      log,
      hooks: Vec::new(),
    }
  }

  /// Register a hook.
  pub fn add_hook(&mut self, hook: Arc<dyn CaptureHook>) {
    self.hooks.push(hook);
  }

  /// The backing log.
  pub fn log(&self) -> &Arc<CaptureLog> {
    &self.log
  }

  /// Whether any hook is registered.
  pub fn has_hooks(&self) -> bool {
    !self.hooks.is_empty()
  }

  pub(crate) async fn request_start(&self, draft: &EntryDraft) {
    for hook in &self.hooks {
      hook.on_request_start(draft).await;
    }
  }

  pub(crate) async fn request_headers_complete(&self, draft: &EntryDraft) {
    for hook in &self.hooks {
      hook.on_request_headers_complete(draft).await;
    }
  }

  pub(crate) async fn response_headers_complete(&self, draft: &EntryDraft) {
    for hook in &self.hooks {
      hook.on_response_headers_complete(draft).await;
    }
  }

  pub(crate) async fn response_body_chunk(&self, draft: &EntryDraft, chunk: &[u8]) {
    for hook in &self.hooks {
      hook.on_response_body_chunk(draft, chunk).await;
    }
  }

  /// Append a finished entry, then notify hooks.
  pub async fn complete(&self, entry: Entry) -> Arc<Entry> {
    let entry = self.log.add_entry(entry);
    for hook in &self.hooks {
      hook.on_complete(&entry).await;
    }
    entry
  }

  /// Append a failed entry, then notify hooks.
  pub async fn fail(&self, entry: Entry, failure: &Failure) -> Arc<Entry> {
    let entry = self.log.add_entry(entry);
    for hook in &self.hooks {
      hook.on_failure(&entry, failure).await;
    }
    entry
  }
}

/// Hook that logs every transaction through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

#[async_trait::async_trait]
impl CaptureHook for LoggingHook {
  async fn on_request_start(&self, draft: &EntryDraft) {
    tracing::debug!("[CAPTURE] {} {}", draft.method(), draft.url());
  }

  async fn on_response_headers_complete(&self, draft: &EntryDraft) {
    if let Some(status) = draft.status() {
      tracing::debug!("[CAPTURE] {} {} -> {}", draft.method(), draft.url(), status);
    }
  }

  async fn on_complete(&self, entry: &Arc<Entry>) {
    tracing::info!(
      "[CAPTURE] {} {} {} {:.1}ms",
      entry.request.method,
      entry.request.url,
      entry.response.status,
      entry.time()
    );
  }

  async fn on_failure(&self, entry: &Arc<Entry>, failure: &Failure) {
    tracing::warn!(
      "[CAPTURE] {} {} failed: {}",
      entry.request.method,
      entry.request.url,
      failure
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capture::CaptureTypes;
  use http::{Method, Version};
  use std::sync::Mutex;

  #[derive(Default)]
  struct Recorder {
    events: Mutex<Vec<String>>,
  }

  #[async_trait::async_trait]
  impl CaptureHook for Recorder {
    async fn on_request_start(&self, draft: &EntryDraft) {
      self.events.lock().unwrap().push(format!("start {}", draft.url()));
    }

    async fn on_complete(&self, entry: &Arc<Entry>) {
      self
        .events
        .lock()
        .unwrap()
        .push(format!("complete {}", entry.request.url));
    }

    async fn on_failure(&self, entry: &Arc<Entry>, failure: &Failure) {
      self
        .events
        .lock()
        .unwrap()
        .push(format!("failure {} {}", entry.response.status, failure));
    }
  }

  fn draft(url: &str) -> EntryDraft {
    EntryDraft::new(&Method::GET, url, Version::HTTP_11, CaptureTypes::all(), 100)
  }

  #[tokio::test]
  async fn entries_reach_log_before_hooks() {
    let log = Arc::new(CaptureLog::default());
    let recorder = Arc::new(Recorder::default());
    let mut pipeline = CapturePipeline::new(log.clone());
    pipeline.add_hook(recorder.clone());
    pipeline.add_hook(Arc::new(LoggingHook));

    let d = draft("http://a.test/");
    pipeline.request_start(&d).await;
    let entry = pipeline.complete(d.finish()).await;
    assert_eq!(log.len(), 1);
    assert!(Arc::ptr_eq(&entry, &log.entries()[0]));

    let failed = pipeline
      .fail(draft("http://b.test/").fail(&Failure::Connection), &Failure::Connection)
      .await;
    assert_eq!(failed.response.status, 0);
    assert_eq!(log.len(), 2);

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
      events,
      vec![
        "start http://a.test/".to_string(),
        "complete http://a.test/".to_string(),
        format!("failure 0 {}", Failure::Connection),
      ]
    );
  }
}
