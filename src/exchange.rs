//! One request/response transaction over an open upstream connection
//!
//! The request is streamed upstream while a bounded copy is kept for the
//! capture entry. The response is streamed back the same way, unless a
//! rewrite rule matches, in which case the body is buffered, decoded,
//! rewritten and re-sent with a fresh `Content-Length`.

use crate::capture::CaptureType;
use crate::errors::{Error, Failure, Result};
use crate::hooks::CapturePipeline;
use crate::http::{
  decode_content, error_response, finish_body, write_body_chunk, BodyDecoder, BodyFraming,
  BodySink, RequestHead, ResponseHead,
};
use crate::record::EntryDraft;
use crate::rewrite::RewriteRule;
use crate::server::ProxyContext;
use crate::socket::{tunnel, Upstream};
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, StatusCode};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// What the connection does after a transaction.
#[derive(Debug)]
pub(crate) enum Outcome {
  KeepAlive,
  Close,
  /// A reused upstream connection was found closed before it answered.
  /// Nothing reached the client; the request can be sent again.
  Stale(Box<(RequestHead, EntryDraft)>),
}

/// Failure recorded when relaying a body broke off.
fn relay_failure(error: &Error) -> Failure {
  if error.is_timeout() {
    Failure::ResponseTimeout
  } else {
    Failure::NoResponse
  }
}

/// Wait for the next request head on an idle connection.
///
/// `Ok(None)` on clean EOF, idle timeout or shutdown.
pub(crate) async fn next_request<R>(
  reader: &mut R,
  idle: Duration,
  shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  if *shutdown.borrow() {
    return Ok(None);
  }
  tokio::select! {
    head = tokio::time::timeout(idle, RequestHead::read(reader)) => match head {
      Ok(Err(e)) if e.is_timeout() => {
        tracing::debug!("[PROXY] idle connection closed");
        Ok(None)
      }
      Ok(head) => head,
      Err(_) => {
        tracing::debug!("[PROXY] idle connection closed");
        Ok(None)
      }
    },
    _ = shutdown.changed() => Ok(None),
  }
}

/// Open a draft for `head` and announce it to hooks.
pub(crate) async fn begin(pipeline: &CapturePipeline, head: &RequestHead, url: String) -> EntryDraft {
  let log = pipeline.log();
  let draft = EntryDraft::new(
    &head.method,
    url,
    head.version,
    log.capture_types(),
    log.max_body_chars(),
  );
  pipeline.request_start(&draft).await;
  draft
}

/// Record `failure` and, when nothing was relayed yet, answer the client.
pub(crate) async fn abort<C>(
  client: &mut C,
  draft: EntryDraft,
  failure: Failure,
  pipeline: &CapturePipeline,
  respond: bool,
) -> Outcome
where
  C: AsyncWrite + Unpin,
{
  tracing::debug!("[PROXY] {} {} failed: {}", draft.method(), draft.url(), failure);
  if respond {
    let (status, reason) = failure.client_status();
    let response = error_response(status, reason, &failure.to_string());
    if client.write_all(&response).await.is_ok() {
      let _ = client.flush().await;
    }
  }
  pipeline.fail(draft.fail(&failure), &failure).await;
  Outcome::Close
}

async fn send_request<C>(
  client: &mut C,
  upstream: &mut Upstream,
  head: &RequestHead,
  framing: BodyFraming,
  draft: &mut EntryDraft,
  pipeline: &CapturePipeline,
) -> Result<()>
where
  C: AsyncBufRead + Unpin,
{
  draft.begin_send();
  upstream.io.write_all(&head.to_raw()).await?;
  if framing == BodyFraming::Empty {
    upstream.io.flush().await?;
  }
  pipeline.request_headers_complete(draft).await;
  let mut sink = BodySink::new(draft.body_capture_limit(CaptureType::RequestBody));
  let mut decoder = BodyDecoder::new(framing);
  while let Some(chunk) = decoder.next_chunk(client).await? {
    sink.push(&chunk);
    write_body_chunk(&mut upstream.io, framing, &chunk).await?;
  }
  finish_body(&mut upstream.io, framing).await?;
  draft.record_request_body(head, &sink);
  Ok(())
}

/// Forward interim responses until the final head arrives. `interim` is
/// set once one was written to the client.
async fn read_final_head<C>(
  client: &mut C,
  upstream: &mut Upstream,
  timeout: Duration,
  interim: &mut bool,
) -> std::result::Result<ResponseHead, Failure>
where
  C: AsyncWrite + Unpin,
{
  loop {
    let head = match tokio::time::timeout(timeout, ResponseHead::read(&mut upstream.io)).await {
      Err(_) => return Err(Failure::ResponseTimeout),
      Ok(Err(e)) if e.is_timeout() => return Err(Failure::ResponseTimeout),
      Ok(Err(e)) => {
        tracing::debug!("[PROXY] reading response from {}: {}", upstream.authority, e);
        return Err(Failure::NoResponse);
      }
      Ok(Ok(None)) => return Err(Failure::NoResponse),
      Ok(Ok(Some(head))) => head,
    };
    if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
      *interim = true;
      client
        .write_all(&head.to_raw())
        .await
        .map_err(|_| Failure::NoResponse)?;
      client.flush().await.map_err(|_| Failure::NoResponse)?;
      continue;
    }
    return Ok(head);
  }
}

/// Run one transaction. `head` must already be in the form sent upstream.
///
/// With `reused` set, a bodiless idempotent request whose connection turns
/// out to be closed comes back as [`Outcome::Stale`] instead of failing.
pub(crate) async fn exchange<C>(
  client: &mut C,
  upstream: &mut Upstream,
  head: RequestHead,
  mut draft: EntryDraft,
  pipeline: &CapturePipeline,
  ctx: &ProxyContext,
  reused: bool,
) -> Result<Outcome>
where
  C: AsyncBufRead + AsyncWrite + Unpin + Send,
{
  let setup = upstream.take_setup();
  draft.record_connection(upstream.server_ip, &upstream.id, setup.as_ref());
  draft.record_request_head(&head);
  let request_framing = match head.framing() {
    Ok(framing) => framing,
    Err(e) => {
      let _ = client
        .write_all(&error_response(400, "Bad Request", &e.to_string()))
        .await;
      let _ = client.flush().await;
      pipeline.fail(draft.fail(&Failure::NoResponse), &Failure::NoResponse).await;
      return Ok(Outcome::Close);
    }
  };

  let retryable = reused && request_framing == BodyFraming::Empty && head.method.is_idempotent();

  if let Err(e) = send_request(client, upstream, &head, request_framing, &mut draft, pipeline).await {
    tracing::debug!("[PROXY] sending {} failed: {}", draft.url(), e);
    if retryable && !e.is_timeout() {
      return Ok(Outcome::Stale(Box::new((head, draft))));
    }
    return Ok(abort(client, draft, Failure::NoResponse, pipeline, true).await);
  }

  let mut interim = false;
  let response = match read_final_head(client, upstream, ctx.settings.response_timeout, &mut interim).await {
    Ok(response) => response,
    Err(Failure::NoResponse) if retryable && !interim => {
      return Ok(Outcome::Stale(Box::new((head, draft))));
    }
    Err(failure) => return Ok(abort(client, draft, failure, pipeline, true).await),
  };
  draft.record_response_head(&response);
  pipeline.response_headers_complete(&draft).await;

  if response.status == StatusCode::SWITCHING_PROTOCOLS {
    client.write_all(&response.to_raw()).await?;
    client.flush().await?;
    draft.record_response_body(&response.headers, &BodySink::new(0), 0);
    draft.note("connection upgraded");
    pipeline.complete(draft.finish()).await;
    match tunnel(client, &mut upstream.io, ctx.settings.idle_timeout).await {
      Ok((up, down)) => tracing::debug!("[PROXY] upgraded tunnel closed ({} up, {} down)", up, down),
      Err(e) => tracing::debug!("[PROXY] upgraded tunnel: {}", e),
    }
    return Ok(Outcome::Close);
  }

  let framing = match response.framing(&head.method) {
    Ok(framing) => framing,
    Err(e) => {
      tracing::debug!("[PROXY] bad response framing from {}: {}", upstream.authority, e);
      return Ok(abort(client, draft, Failure::NoResponse, pipeline, true).await);
    }
  };
  let keep_alive = head.keep_alive() && response.keep_alive() && framing != BodyFraming::UntilClose;

  let rule = if framing == BodyFraming::Empty {
    None
  } else {
    ctx.rewrite_rule_for(draft.url())
  };
  let relayed = match rule {
    Some(rule) => {
      relay_rewritten(client, upstream, response, framing, &rule, &mut draft, pipeline, ctx).await
    }
    None => relay(client, upstream, &response, framing, &mut draft, pipeline).await,
  };
  if let Err(e) = relayed {
    tracing::debug!("[PROXY] relaying response for {} failed: {}", draft.url(), e);
    return Ok(abort(client, draft, relay_failure(&e), pipeline, false).await);
  }
  pipeline.complete(draft.finish()).await;
  Ok(if keep_alive {
    Outcome::KeepAlive
  } else {
    Outcome::Close
  })
}

/// Stream the response as received.
async fn relay<C>(
  client: &mut C,
  upstream: &mut Upstream,
  response: &ResponseHead,
  framing: BodyFraming,
  draft: &mut EntryDraft,
  pipeline: &CapturePipeline,
) -> Result<()>
where
  C: AsyncWrite + Unpin,
{
  client.write_all(&response.to_raw()).await?;
  let decoder = BodyDecoder::new(framing);
  relay_remaining(client, upstream, response, framing, Vec::new(), decoder, draft, pipeline).await
}

#[allow(clippy::too_many_arguments)]
async fn relay_rewritten<C>(
  client: &mut C,
  upstream: &mut Upstream,
  mut response: ResponseHead,
  framing: BodyFraming,
  rule: &RewriteRule,
  draft: &mut EntryDraft,
  pipeline: &CapturePipeline,
  ctx: &ProxyContext,
) -> Result<()>
where
  C: AsyncWrite + Unpin,
{
  let limit = ctx.settings.max_rewrite_buffer;
  let mut decoder = BodyDecoder::new(framing);
  let mut pieces = Vec::new();
  let mut buffered = 0usize;
  loop {
    match decoder.next_chunk(&mut upstream.io).await? {
      Some(chunk) => {
        buffered += chunk.len();
        pieces.push(chunk);
        if buffered > limit {
          draft.note(format!(
            "rewrite skipped: body exceeds the rewrite buffer of {} bytes",
            limit
          ));
          // the decoder already consumed part of the body; hand the rest over
          client.write_all(&response.to_raw()).await?;
          return relay_remaining(client, upstream, &response, framing, pieces, decoder, draft, pipeline)
            .await;
        }
      }
      None => break,
    }
  }

  let original: Vec<u8> = pieces.iter().flat_map(|p| p.iter().copied()).collect();
  let mut sink = BodySink::new(draft.body_capture_limit(CaptureType::ResponseBody));
  sink.push(&original);
  let wire_bytes = decoder.wire_bytes();

  let Some(decoded) = decode_content(&response.headers, &original) else {
    draft.note("rewrite skipped: unsupported content encoding");
    client.write_all(&response.to_raw()).await?;
    write_body_chunk(client, framing, &original).await?;
    finish_body(client, framing).await?;
    pipeline.response_body_chunk(draft, &original).await;
    draft.record_response_body(&response.headers, &sink, wire_bytes);
    return Ok(());
  };

  let rewritten = rule.apply(&decoded);
  let captured_headers = response.headers.clone();
  response.headers.remove(TRANSFER_ENCODING);
  response.headers.remove(CONTENT_ENCODING);
  response
    .headers
    .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len() as u64));
  client.write_all(&response.to_raw()).await?;
  client.write_all(&rewritten).await?;
  client.flush().await?;
  pipeline.response_body_chunk(draft, &rewritten).await;
  draft.note(format!("response rewritten by rule matching {:?}", rule.url_match));
  draft.record_response_body(&captured_headers, &sink, wire_bytes);
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn relay_remaining<C>(
  client: &mut C,
  upstream: &mut Upstream,
  response: &ResponseHead,
  framing: BodyFraming,
  buffered: Vec<Bytes>,
  mut decoder: BodyDecoder,
  draft: &mut EntryDraft,
  pipeline: &CapturePipeline,
) -> Result<()>
where
  C: AsyncWrite + Unpin,
{
  let mut sink = BodySink::new(draft.body_capture_limit(CaptureType::ResponseBody));
  for chunk in buffered {
    sink.push(&chunk);
    write_body_chunk(client, framing, &chunk).await?;
    pipeline.response_body_chunk(draft, &chunk).await;
  }
  while let Some(chunk) = decoder.next_chunk(&mut upstream.io).await? {
    sink.push(&chunk);
    write_body_chunk(client, framing, &chunk).await?;
    pipeline.response_body_chunk(draft, &chunk).await;
  }
  finish_body(client, framing).await?;
  draft.record_response_body(&response.headers, &sink, decoder.wire_bytes());
  Ok(())
}
