//! Capture log: the ordered store of recorded entries and their pages
//!
//! Entries and pages live behind a single lock so that page rollover and
//! appends happen in one critical section. Readers get snapshots of
//! `Arc<Entry>` and never hold the lock while processing.
use crate::errors::{Error, Result};
use crate::har::{Entry, Har, Page, PageTimings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::macros::format_description;
use time::OffsetDateTime;

/// Default number of entries a page holds before a new page is opened.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
/// Default cap on captured body text, in characters.
pub const DEFAULT_MAX_BODY_CHARS: usize = 100_000;

/// A category of data recorded for each transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
  /// request headers
  RequestHeaders,
  /// request cookies
  RequestCookies,
  /// request body
  RequestBody,
  /// response headers
  ResponseHeaders,
  /// response cookies
  ResponseCookies,
  /// response body
  ResponseBody,
}

impl CaptureType {
  /// Every category.
  pub const ALL: [CaptureType; 6] = [
    CaptureType::RequestHeaders,
    CaptureType::RequestCookies,
    CaptureType::RequestBody,
    CaptureType::ResponseHeaders,
    CaptureType::ResponseCookies,
    CaptureType::ResponseBody,
  ];

  fn bit(self) -> u8 {
    1 << (self as u8)
  }
}

/// Set of enabled [`CaptureType`]s.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CaptureType>", into = "Vec<CaptureType>")]
pub struct CaptureTypes(u8);

impl CaptureTypes {
  /// Nothing but request line, status and timings.
  pub const fn none() -> Self {
    CaptureTypes(0)
  }

  /// Every category.
  pub const fn all() -> Self {
    CaptureTypes(0b11_1111)
  }

  /// Add a category.
  pub fn with(mut self, kind: CaptureType) -> Self {
    self.0 |= kind.bit();
    self
  }

  /// Remove a category.
  pub fn without(mut self, kind: CaptureType) -> Self {
    self.0 &= !kind.bit();
    self
  }

  /// Whether a category is enabled.
  pub fn contains(&self, kind: CaptureType) -> bool {
    self.0 & kind.bit() != 0
  }
}

impl Default for CaptureTypes {
  fn default() -> Self {
    CaptureTypes::all()
  }
}

impl fmt::Debug for CaptureTypes {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set()
      .entries(CaptureType::ALL.iter().filter(|k| self.contains(**k)))
      .finish()
  }
}

impl FromIterator<CaptureType> for CaptureTypes {
  fn from_iter<T: IntoIterator<Item = CaptureType>>(iter: T) -> Self {
    iter
      .into_iter()
      .fold(CaptureTypes::none(), |set, kind| set.with(kind))
  }
}

impl From<Vec<CaptureType>> for CaptureTypes {
  fn from(value: Vec<CaptureType>) -> Self {
    value.into_iter().collect()
  }
}

impl From<CaptureTypes> for Vec<CaptureType> {
  fn from(value: CaptureTypes) -> Self {
    CaptureType::ALL
      .into_iter()
      .filter(|k| value.contains(*k))
      .collect()
  }
}

#[derive(Default)]
struct LogState {
  pages: Vec<Page>,
  entries: Vec<Arc<Entry>>,
  active_page: Option<usize>,
  active_count: usize,
  next_page: usize,
}

impl LogState {
  fn find_page(&self, id: &str) -> Option<usize> {
    self.pages.iter().position(|p| p.id == id)
  }

  fn open_page(&mut self, id: String, title: String) {
    self.pages.push(Page {
      started_date_time: OffsetDateTime::now_utc(),
      id,
      title,
      page_timings: PageTimings::default(),
      comment: None,
    });
    self.active_page = Some(self.pages.len() - 1);
    self.active_count = 0;
  }

  fn open_generated_page(&mut self) {
    loop {
      self.next_page += 1;
      let id = format!("page_{}", self.next_page);
      if self.find_page(&id).is_none() {
        self.open_page(id, page_title(OffsetDateTime::now_utc()));
        return;
      }
    }
  }
}

fn page_title(now: OffsetDateTime) -> String {
  let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
  match now.format(&format) {
    Ok(stamp) => format!("Capture {}", stamp),
    Err(_) => "Capture".to_string(),
  }
}

/// Thread-safe, append-only log of captured transactions.
pub struct CaptureLog {
  state: RwLock<LogState>,
  capture_types: AtomicU8,
  page_size: AtomicUsize,
  max_body_chars: AtomicUsize,
}

impl Default for CaptureLog {
  fn default() -> Self {
    CaptureLog::new(DEFAULT_PAGE_SIZE, DEFAULT_MAX_BODY_CHARS)
  }
}

impl fmt::Debug for CaptureLog {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.read();
    f.debug_struct("CaptureLog")
      .field("pages", &state.pages.len())
      .field("entries", &state.entries.len())
      .field("capture_types", &self.capture_types())
      .finish()
  }
}

impl CaptureLog {
  /// Create an empty log.
  ///
  /// `page_size` and `max_body_chars` are clamped to at least one.
  pub fn new(page_size: usize, max_body_chars: usize) -> Self {
    CaptureLog {
      state: RwLock::new(LogState::default()),
      capture_types: AtomicU8::new(CaptureTypes::all().0),
      page_size: AtomicUsize::new(page_size.max(1)),
      max_body_chars: AtomicUsize::new(max_body_chars.max(1)),
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, LogState> {
    self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, LogState> {
    self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Enabled capture categories.
  pub fn capture_types(&self) -> CaptureTypes {
    CaptureTypes(self.capture_types.load(Ordering::Relaxed))
  }

  /// Replace the enabled capture categories. Affects transactions that
  /// start afterwards.
  pub fn set_capture_types(&self, types: CaptureTypes) {
    self.capture_types.store(types.0, Ordering::Relaxed);
  }

  /// Maximum characters of body text stored per entry.
  pub fn max_body_chars(&self) -> usize {
    self.max_body_chars.load(Ordering::Relaxed)
  }

  /// Change the body cap.
  pub fn set_max_body_chars(&self, chars: usize) {
    self.max_body_chars.store(chars.max(1), Ordering::Relaxed);
  }

  /// Entries per page before rollover.
  pub fn page_size(&self) -> usize {
    self.page_size.load(Ordering::Relaxed)
  }

  /// Change the rollover threshold.
  pub fn set_page_size(&self, size: usize) {
    self.page_size.store(size.max(1), Ordering::Relaxed);
  }

  /// Open a page and make it active. Page ids are unique.
  pub fn new_page(&self, id: impl Into<String>, title: impl Into<String>) -> Result<()> {
    let id = id.into();
    let mut state = self.write();
    if state.find_page(&id).is_some() {
      return Err(Error::invalid_config(format!("duplicate page id {}", id)));
    }
    state.open_page(id, title.into());
    Ok(())
  }

  /// Append a finalized entry to the active page, opening a new page first
  /// when there is none or the active one is full.
  pub fn add_entry(&self, mut entry: Entry) -> Arc<Entry> {
    let page_size = self.page_size();
    let mut state = self.write();
    if state.active_page.is_none() || state.active_count >= page_size {
      state.open_generated_page();
    }
    if let Some(index) = state.active_page {
      entry.pageref = Some(state.pages[index].id.clone());
    }
    let entry = Arc::new(entry);
    state.entries.push(entry.clone());
    state.active_count += 1;
    entry
  }

  /// Snapshot of all entries in insertion order.
  pub fn entries(&self) -> Vec<Arc<Entry>> {
    self.read().entries.clone()
  }

  /// Snapshot of all pages.
  pub fn pages(&self) -> Vec<Page> {
    self.read().pages.clone()
  }

  /// Entries referencing a page.
  pub fn entries_for_page(&self, id: &str) -> Vec<Arc<Entry>> {
    self
      .read()
      .entries
      .iter()
      .filter(|e| e.pageref.as_deref() == Some(id))
      .cloned()
      .collect()
  }

  /// Id of the page new entries go to.
  pub fn active_page(&self) -> Option<String> {
    let state = self.read();
    state.active_page.map(|index| state.pages[index].id.clone())
  }

  /// Number of stored entries.
  pub fn len(&self) -> usize {
    self.read().entries.len()
  }

  /// `true` when nothing has been captured.
  pub fn is_empty(&self) -> bool {
    self.read().entries.is_empty()
  }

  /// Entries whose URL contains `constraint` or any whitespace separated
  /// token of it.
  pub fn filter(&self, constraint: &str) -> Vec<Arc<Entry>> {
    filter_entries(&self.entries(), constraint)
  }

  /// Remove every entry. Pages are kept.
  pub fn clear_all(&self) {
    let mut state = self.write();
    state.entries.clear();
    state.active_count = 0;
  }

  /// Remove a page and the entries that reference it. Returns `false` when
  /// the page does not exist.
  pub fn delete_page(&self, id: &str) -> bool {
    let mut state = self.write();
    let Some(index) = state.find_page(id) else {
      return false;
    };
    state.pages.remove(index);
    state.entries.retain(|e| e.pageref.as_deref() != Some(id));
    state.active_page = match state.active_page {
      Some(active) if active == index => None,
      Some(active) if active > index => Some(active - 1),
      other => other,
    };
    if state.active_page.is_none() {
      state.active_count = 0;
    }
    true
  }

  /// Build a HAR document from the current contents.
  pub fn to_har(&self) -> Har {
    let state = self.read();
    Har::new(
      state.pages.clone(),
      state.entries.iter().map(|e| e.as_ref().clone()).collect(),
    )
  }

  /// Append the pages and entries of a HAR document. Imported entries keep
  /// their page references; the active page is left untouched.
  pub fn import(&self, har: Har) -> Result<usize> {
    let mut state = self.write();
    for page in &har.log.pages {
      if state.find_page(&page.id).is_some() {
        return Err(Error::import(format!("page {} already exists", page.id)));
      }
    }
    let imported = har.log.entries.len();
    state.pages.extend(har.log.pages);
    state
      .entries
      .extend(har.log.entries.into_iter().map(Arc::new));
    Ok(imported)
  }

  /// Write the log as a HAR file.
  pub async fn export_to(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = self.to_har().to_json_pretty()?;
    tokio::fs::write(path, text)
      .await
      .map_err(|e| Error::export(format!("{}: {}", path.display(), e)))
  }

  /// Read a HAR file and append its contents.
  pub async fn import_from(&self, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| Error::import(format!("{}: {}", path.display(), e)))?;
    self.import(Har::from_json(&text)?)
  }
}

/// Filter a snapshot: an entry matches when its URL contains the whole
/// constraint or any of its whitespace separated tokens. Matching is
/// case-sensitive.
pub fn filter_entries(entries: &[Arc<Entry>], constraint: &str) -> Vec<Arc<Entry>> {
  let tokens: Vec<&str> = constraint.split_whitespace().collect();
  entries
    .iter()
    .filter(|e| {
      let url = e.request.url.as_str();
      url.contains(constraint) || tokens.iter().any(|t| url.contains(t))
    })
    .cloned()
    .collect()
}
