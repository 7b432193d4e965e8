//! Response streaming tee: forwards upstream response bytes to the client
//! while concurrently capturing them for storage and, for SSE responses,
//! feeding them through the line parser. A serialized "copy, then drain
//! the parser" loop deadlocks once the parser's output channel fills while
//! the caller is still blocked writing to the client; the fix here is the
//! same shape the concurrency model calls for: bytes go to the client
//! synchronously inside the tee task, while a separate task drains parsed
//! events (persisting and broadcasting them) concurrently. Both finish
//! before FINALIZE runs.

use super::{classify_upstream_error, full_body, Engine, RespBody};
use crate::broadcast::Broadcaster;
use crate::error::EngineError;
use crate::model::{DropLogEntry, DropReason, Event, Flow, FlowIntegrity, Priority, Provider};
use crate::sse::{Feed, SseParser};
use crate::store::Store;
use crate::{providers, pricing, redact, tools};

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{HeaderMap, Response};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const SSE_QUEUE_CAPACITY: usize = 200;
const QUEUE_FULL_RETRY_DELAY: Duration = Duration::from_millis(20);
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(200);

const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Outcome of offering an event to the bounded queue: queued outright,
/// queued after evicting a lower-priority item, or still full (every
/// queued item is already `High` priority and so is the new one).
enum OfferOutcome {
    Queued,
    Full(Event),
}

/// Bounded priority queue feeding the event-consumer task. A plain
/// `mpsc` channel can't express "evict the oldest low-priority item to
/// make room", so this is a small hand-rolled structure instead.
struct SseEventQueue {
    inner: std::sync::Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SseEventQueue {
    fn new(capacity: usize) -> Self {
        Self { inner: std::sync::Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), closed: AtomicBool::new(false), capacity }
    }

    fn offer(&self, event: Event) -> OfferOutcome {
        let mut queue = self.inner.lock().expect("sse event queue mutex poisoned");
        if queue.len() < self.capacity {
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return OfferOutcome::Queued;
        }
        if let Some(pos) = queue.iter().position(|e| e.priority == Priority::Low) {
            queue.remove(pos);
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return OfferOutcome::Queued;
        }
        if let Some(pos) = queue.iter().position(|e| e.priority == Priority::Medium) {
            queue.remove(pos);
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return OfferOutcome::Queued;
        }
        OfferOutcome::Full(event)
    }

    fn pop(&self) -> Option<Event> {
        self.inner.lock().expect("sse event queue mutex poisoned").pop_front()
    }

    async fn wait_for_item(&self) {
        self.notify.notified().await;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Offer an event, retrying once after a short delay if the queue is full
/// of high-priority items, then falling back to a synchronous persist
/// (with a `queue_full` drop_log entry) so a burst of high-priority events
/// is never silently dropped.
async fn offer_with_fallback(queue: &SseEventQueue, store: &Store, event: Event) {
    if let OfferOutcome::Full(event) = queue.offer(event) {
        tokio::time::sleep(QUEUE_FULL_RETRY_DELAY).await;
        if let OfferOutcome::Full(event) = queue.offer(event) {
            if let Err(e) = store.save_event(event.clone()).await {
                let transient = e.is_transient();
                let err = EngineError::Store(e);
                if transient {
                    tracing::warn!(flow_id = %event.flow_id, error = %err, "sidecar persist failed");
                } else {
                    tracing::error!(flow_id = %event.flow_id, error = %err, "sidecar persist failed");
                }
            }
            let entry = DropLogEntry {
                flow_id: Some(event.flow_id.clone()),
                event_type: Some(event.event_type.clone()),
                priority: Some(event.priority),
                reason: DropReason::QueueFull,
                timestamp: chrono::Utc::now(),
            };
            if let Err(e) = store.log_drop(entry).await {
                let transient = e.is_transient();
                let err = EngineError::Store(e);
                if transient {
                    tracing::warn!(flow_id = %event.flow_id, error = %err, "failed to record queue_full drop");
                } else {
                    tracing::error!(flow_id = %event.flow_id, error = %err, "failed to record queue_full drop");
                }
            }
        }
    }
}

/// Drains the queue concurrently with the tee task: persists and
/// broadcasts each event as it arrives, polling rather than relying solely
/// on the notify wakeup so a close-then-notify race can't hang forever.
async fn run_event_consumer(queue: Arc<SseEventQueue>, store: Arc<Store>, broadcaster: Arc<dyn Broadcaster>) {
    loop {
        match queue.pop() {
            Some(event) => {
                broadcaster.on_event(&event);
                let flow_id = event.flow_id.clone();
                if let Err(e) = store.save_event(event).await {
                    let transient = e.is_transient();
                    let err = EngineError::Store(e);
                    if transient {
                        tracing::warn!(flow_id = %flow_id, error = %err, "failed to persist sse event");
                    } else {
                        tracing::error!(flow_id = %flow_id, error = %err, "failed to persist sse event");
                    }
                }
            }
            None => {
                if queue.is_closed() {
                    break;
                }
                let _ = tokio::time::timeout(CONSUMER_POLL_INTERVAL, queue.wait_for_item()).await;
            }
        }
    }
}

struct TeeOutcome {
    capture: Vec<u8>,
    truncated: bool,
    integrity: FlowIntegrity,
    events: Vec<Event>,
    events_dropped: u32,
}

fn header_map_to_model(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.entry(name.as_str().to_lowercase()).or_default().push(v.to_string());
        }
    }
    map
}

/// STREAM_RESPONSE: begin streaming the upstream response to the client
/// immediately, with capture/parsing/FINALIZE happening in the background.
/// The caller gets its `Response` back as soon as headers are known; the
/// flow's `update_flow`/`on_flow_updated` happen later, off this request's
/// critical path.
pub(super) async fn stream_and_finalize(
    engine: Engine,
    flow: Flow,
    start: Instant,
    response: reqwest::Response,
) -> Response<RespBody> {
    let status = response.status();
    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);

    let forwarded_headers: Vec<(hyper::header::HeaderName, hyper::header::HeaderValue)> = response
        .headers()
        .iter()
        .filter(|(name, _)| !RESPONSE_HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(16);

    tokio::spawn(tee_and_finalize(engine, flow, start, response, body_tx, is_sse));

    let stream = ReceiverStream::new(body_rx).map(|item| item);
    let body = StreamBody::new(stream).boxed();

    let mut builder = Response::builder().status(status);
    for (name, value) in forwarded_headers {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|_| Response::builder().status(status).body(full_body("")).unwrap())
}

async fn tee_and_finalize(
    engine: Engine,
    mut flow: Flow,
    start: Instant,
    response: reqwest::Response,
    body_tx: mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>,
    is_sse: bool,
) {
    flow.is_sse = is_sse;
    flow.status_code = Some(response.status().as_u16());
    flow.status_text = response.status().canonical_reason().map(str::to_string);
    let response_headers = header_map_to_model(response.headers());

    let settings = &engine.inner.settings;
    let store = engine.inner.store.clone();
    let broadcaster = engine.inner.broadcaster.clone();

    let queue = Arc::new(SseEventQueue::new(SSE_QUEUE_CAPACITY));
    let consumer = tokio::spawn(run_event_consumer(queue.clone(), store.clone(), broadcaster.clone()));

    let outcome = run_tee(response, body_tx, is_sse, flow.id.clone(), settings.body_max_bytes, &queue, &store).await;
    queue.close();
    let _ = consumer.await;

    flow.flow_integrity = outcome.integrity;
    flow.events_dropped_count = outcome.events_dropped;
    flow.response_body_truncated = outcome.truncated;
    flow.response_headers = Some(redact::redact_headers(&response_headers, &settings.always_redact_headers, &settings.header_redact_patterns));

    if redact::should_store_body(settings.raw_body_storage) {
        let body_str = String::from_utf8_lossy(&outcome.capture).into_owned();
        flow.response_body = Some(redact::redact_body(&body_str, settings.redact_api_keys, settings.redact_base64_images, &[]));
    }

    if flow.provider != Provider::Other {
        let usage = if is_sse {
            crate::sse::extract_usage(&outcome.events)
        } else {
            providers::parse_usage(flow.provider, &outcome.capture, false)
        };
        let model = if is_sse { crate::sse::extract_model(&outcome.events) } else { providers::extract_model(flow.provider, &outcome.capture) };
        if model.is_some() {
            flow.model = model;
        }

        if usage.input_tokens > 0 {
            flow.input_tokens = Some(usage.input_tokens);
            flow.output_tokens = Some(usage.output_tokens);
            flow.cache_creation_tokens = Some(usage.cache_creation_tokens);
            flow.cache_read_tokens = Some(usage.cache_read_tokens);

            // Cost needs a model to look up a rate for; leave it null
            // rather than falling back to FALLBACK_RATE against an empty
            // model string when extraction failed to find one.
            if let Some(model) = flow.model.as_deref() {
                let rate = match store.pricing_rate(flow.provider.as_str(), model).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(flow_id = %flow.id, error = %EngineError::Store(e), "pricing lookup failed");
                        None
                    }
                };
                let (cost, source) = pricing::compute_cost(&usage, rate);
                flow.total_cost = cost;
                flow.cost_source = source;
            }
        }

        if is_sse {
            let tool_uses = crate::sse::extract_tool_uses(&outcome.events);
            for inv in tools::invocations_from_response(&flow.id, flow.task_id.clone(), &tool_uses) {
                if let Err(e) = store.save_tool_invocation(inv).await {
                    let transient = e.is_transient();
                    let err = EngineError::Store(e);
                    if transient {
                        tracing::warn!(flow_id = %flow.id, error = %err, "failed to persist tool invocation");
                    } else {
                        tracing::error!(flow_id = %flow.id, error = %err, "failed to persist tool invocation");
                    }
                }
            }
        }
    }

    flow.duration_ms = Some(start.elapsed().as_millis() as i64);

    if let Err(e) = store.update_flow(flow.clone()).await {
        let transient = e.is_transient();
        let err = EngineError::Store(e);
        if transient {
            tracing::warn!(flow_id = %flow.id, error = %err, "failed to update flow at finalize");
        } else {
            tracing::error!(flow_id = %flow.id, error = %err, "failed to update flow at finalize");
        }
    }
    broadcaster.on_flow_updated(&flow);
}

async fn run_tee(
    mut upstream: reqwest::Response,
    body_tx: mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>,
    is_sse: bool,
    flow_id: String,
    body_max_bytes: usize,
    event_queue: &SseEventQueue,
    store: &Arc<Store>,
) -> TeeOutcome {
    let mut parser = SseParser::new(flow_id.clone());
    let mut capture: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut line_buf = String::new();
    let mut integrity = FlowIntegrity::Complete;
    let mut events = Vec::new();
    let mut event_cap_logged = false;
    let start = Instant::now();

    loop {
        let chunk = match upstream.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let err = classify_upstream_error(&e);
                tracing::warn!(flow_id = %flow_id, error = %err, "upstream body read failed mid-stream");
                integrity = FlowIntegrity::Interrupted;
                break;
            }
        };

        // Bytes reach the client unconditionally and untruncated; only the
        // stored capture is capped. A closed client channel just means
        // nobody is reading anymore -- capture and parsing still matter.
        let _ = body_tx.send(Ok(Frame::data(chunk.clone()))).await;

        if capture.len() < body_max_bytes {
            let take = (body_max_bytes - capture.len()).min(chunk.len());
            capture.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                truncated = true;
            }
        } else {
            truncated = true;
        }

        if is_sse && integrity != FlowIntegrity::Corrupted {
            line_buf.push_str(&String::from_utf8_lossy(&chunk));

            // A line with no terminating '\n' would otherwise grow
            // line_buf without bound forever, since feed_line (and its own
            // MAX_LINE_BYTES check) only ever sees a line once one is
            // found. Check the accumulating buffer itself, independent of
            // whether a newline has shown up yet.
            if line_buf.len() > crate::sse::MAX_LINE_BYTES {
                integrity = FlowIntegrity::Corrupted;
                line_buf.clear();
                let entry = DropLogEntry {
                    flow_id: Some(flow_id.clone()),
                    event_type: None,
                    priority: None,
                    reason: DropReason::SizeCap,
                    timestamp: chrono::Utc::now(),
                };
                if let Err(e) = store.log_drop(entry).await {
                    let err = EngineError::CapExceeded(e.to_string());
                    tracing::warn!(flow_id = %flow_id, error = %err, "failed to record size_cap drop");
                }
                continue;
            }

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                let now_ns = start.elapsed().as_nanos() as i64;
                match parser.feed_line(&line, now_ns) {
                    Feed::Continue => {}
                    Feed::Event(event) => {
                        events.push(event.clone());
                        offer_with_fallback(event_queue, store, event).await;
                    }
                    Feed::LineTooLong => {
                        integrity = FlowIntegrity::Corrupted;
                        let entry = DropLogEntry {
                            flow_id: Some(flow_id.clone()),
                            event_type: None,
                            priority: None,
                            reason: DropReason::SizeCap,
                            timestamp: chrono::Utc::now(),
                        };
                        if let Err(e) = store.log_drop(entry).await {
                            let err = EngineError::CapExceeded(e.to_string());
                            tracing::warn!(flow_id = %flow_id, error = %err, "failed to record size_cap drop");
                        }
                        break;
                    }
                    Feed::EventCapped => {
                        if !event_cap_logged {
                            event_cap_logged = true;
                            let entry = DropLogEntry {
                                flow_id: Some(flow_id.clone()),
                                event_type: None,
                                priority: None,
                                reason: DropReason::EventCap,
                                timestamp: chrono::Utc::now(),
                            };
                            if let Err(e) = store.log_drop(entry).await {
                                let err = EngineError::CapExceeded(e.to_string());
                                tracing::warn!(flow_id = %flow_id, error = %err, "failed to record event_cap drop");
                            }
                        }
                    }
                }
            }
        }
    }

    if is_sse && integrity != FlowIntegrity::Corrupted {
        let now_ns = start.elapsed().as_nanos() as i64;
        if let Feed::Event(event) = parser.finish(now_ns) {
            events.push(event.clone());
            offer_with_fallback(event_queue, store, event).await;
        }
    }

    TeeOutcome { capture, truncated, integrity, events, events_dropped: parser.events_dropped_count() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(priority: Priority) -> Event {
        Event {
            flow_id: "flow-1".to_string(),
            sequence: 0,
            event_type: "content_block_delta".to_string(),
            event_data: serde_json::json!({}),
            priority,
            timestamp: chrono::Utc::now(),
            timestamp_mono_ns: 0,
        }
    }

    async fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("langley-tee-test-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
        Store::open(&dir.join("langley.db")).unwrap()
    }

    #[test]
    fn header_map_to_model_lowercases_and_groups_multi_values() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1".parse().unwrap());
        headers.append("Set-Cookie", "b=2".parse().unwrap());
        let model = header_map_to_model(&headers);
        assert_eq!(model.get("set-cookie").unwrap(), &vec!["a=1".to_string(), "b=2".to_string()]);
    }

    #[test]
    fn queue_accepts_until_capacity_then_evicts_low_before_medium() {
        let queue = SseEventQueue::new(2);
        assert!(matches!(queue.offer(event(Priority::Low)), OfferOutcome::Queued));
        assert!(matches!(queue.offer(event(Priority::Medium)), OfferOutcome::Queued));
        // queue full of [Low, Medium]; a High offer should evict the Low one.
        assert!(matches!(queue.offer(event(Priority::High)), OfferOutcome::Queued));
        let first = queue.pop().unwrap();
        assert_eq!(first.priority, Priority::Medium);
        let second = queue.pop().unwrap();
        assert_eq!(second.priority, Priority::High);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn queue_full_of_high_priority_events_refuses_more() {
        let queue = SseEventQueue::new(1);
        assert!(matches!(queue.offer(event(Priority::High)), OfferOutcome::Queued));
        match queue.offer(event(Priority::High)) {
            OfferOutcome::Full(e) => assert_eq!(e.priority, Priority::High),
            OfferOutcome::Queued => panic!("expected the queue to report full"),
        }
    }

    #[tokio::test]
    async fn offer_with_fallback_persists_synchronously_and_logs_a_drop_when_queue_stays_full() {
        let store = temp_store().await;
        let queue = SseEventQueue::new(1);
        queue.offer(event(Priority::High));
        offer_with_fallback(&queue, &store, event(Priority::High)).await;
        // The retry sleeps 20ms before falling back; by the time this
        // returns the synchronous persist + drop_log entry must be done.
        assert_eq!(queue.pop().unwrap().priority, Priority::High);
        assert!(queue.pop().is_none(), "the second event should have gone through the synchronous fallback, not the queue");
    }

    #[tokio::test]
    async fn event_consumer_drains_until_closed() {
        let store = Arc::new(temp_store().await);
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(crate::broadcast::NullBroadcaster);
        let queue = Arc::new(SseEventQueue::new(10));
        queue.offer(event(Priority::Low));
        queue.offer(event(Priority::Low));
        queue.close();
        run_event_consumer(queue.clone(), store, broadcaster).await;
        assert!(queue.pop().is_none());
    }
}
