//! In-memory reference event log server.
//!
//! Speaks the same CBOR-over-HTTP wire format as the real API and plugs into
//! [`LoopbackClient`](evsync_engine::LoopbackClient), so engine tests exercise
//! [`HttpEventApi`](evsync_engine::HttpEventApi) end to end.

use evsync_engine::{stream_path, HttpResponse, LoopbackServer};
use evsync_protocol::{ErrorBody, EventBatch, EventId, LatestEventResponse, RawEvent, SyncStreamId};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of events per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Event log of one stream.
///
/// Events are numbered from 1; the id `e{n}` is the position after event
/// `n`, and `e0` is the empty log.
#[derive(Debug, Default)]
struct StreamLog {
    /// Events in commit order with their sequence number.
    events: Vec<(u64, RawEvent)>,
    /// Highest sequence number handed out.
    head: u64,
    /// Ids below this position were garbage collected.
    oldest_valid: u64,
}

impl StreamLog {
    fn events_since(&self, cursor: u64, limit: u32) -> Vec<(u64, RawEvent)> {
        self.events
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .take(limit as usize)
            .cloned()
            .collect()
    }

    fn has_more_after(&self, cursor: u64, limit: u32) -> bool {
        self.events.iter().filter(|(seq, _)| *seq > cursor).count() > limit as usize
    }
}

/// Formats the event id of log position `seq`.
pub fn event_id(seq: u64) -> EventId {
    EventId::new(format!("e{}", seq))
}

fn parse_event_id(id: &str) -> Option<u64> {
    id.strip_prefix('e')?.parse().ok()
}

/// Reference server holding one event log per stream.
///
/// # Example
///
/// ```rust,ignore
/// let server = Arc::new(EventLogServer::new());
/// let stream = SyncStreamId::core("u1");
/// server.append(&stream, [RawEvent::create("label", "l1", vec![1])]);
/// let api = HttpEventApi::new("https://api.test", LoopbackClient::new(server.clone()));
/// ```
#[derive(Debug)]
pub struct EventLogServer {
    logs: RwLock<HashMap<String, StreamLog>>,
    page_size: RwLock<u32>,
    injected: RwLock<VecDeque<(u16, ErrorBody)>>,
    requests: AtomicU64,
}

impl EventLogServer {
    /// Creates a server with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates a server returning at most `page_size` events per page.
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            page_size: RwLock::new(page_size.max(1)),
            injected: RwLock::new(VecDeque::new()),
            requests: AtomicU64::new(0),
        }
    }

    /// Changes the page size.
    pub fn set_page_size(&self, page_size: u32) {
        *self.page_size.write() = page_size.max(1);
    }

    /// Appends events to the stream's log and returns the new head id.
    pub fn append(
        &self,
        stream: &SyncStreamId,
        events: impl IntoIterator<Item = RawEvent>,
    ) -> EventId {
        let mut logs = self.logs.write();
        let log = logs.entry(stream_path(stream)).or_default();
        for event in events {
            log.head += 1;
            let seq = log.head;
            log.events.push((seq, event));
        }
        event_id(log.head)
    }

    /// Returns the head id of the stream's log.
    pub fn latest(&self, stream: &SyncStreamId) -> EventId {
        event_id(
            self.logs
                .read()
                .get(&stream_path(stream))
                .map(|log| log.head)
                .unwrap_or(0),
        )
    }

    /// Forgets the stream's history up to its head.
    ///
    /// Every older id is rejected with
    /// [`ErrorBody::CODE_EVENT_ID_INVALID`] afterwards.
    pub fn gc(&self, stream: &SyncStreamId) {
        let mut logs = self.logs.write();
        let log = logs.entry(stream_path(stream)).or_default();
        log.events.clear();
        log.oldest_valid = log.head;
    }

    /// Fails the next request with `status` and `body`.
    pub fn fail_next(&self, status: u16, body: ErrorBody) {
        self.injected.write().push_back((status, body));
    }

    /// Returns the number of requests handled.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn handle_latest(&self, resource: &str) -> HttpResponse {
        let head = self
            .logs
            .read()
            .get(resource)
            .map(|log| log.head)
            .unwrap_or(0);
        respond(LatestEventResponse::new(event_id(head)).encode())
    }

    fn handle_events(&self, resource: &str, since: &str) -> HttpResponse {
        let logs = self.logs.read();
        let empty = StreamLog::default();
        let log = logs.get(resource).unwrap_or(&empty);

        let cursor = match parse_event_id(since) {
            Some(cursor) if cursor >= log.oldest_valid && cursor <= log.head => cursor,
            _ => {
                return error(
                    422,
                    ErrorBody::new(
                        ErrorBody::CODE_EVENT_ID_INVALID,
                        format!("unknown event id {}", since),
                    ),
                )
            }
        };

        let limit = *self.page_size.read();
        let page = log.events_since(cursor, limit);
        let more = log.has_more_after(cursor, limit);
        let next = page.last().map(|(seq, _)| *seq).unwrap_or(cursor);
        let events = page.into_iter().map(|(_, event)| event).collect();

        respond(EventBatch::new(events, event_id(next), more).encode())
    }
}

impl Default for EventLogServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer for EventLogServer {
    fn handle_get(&self, path: &str) -> HttpResponse {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some((status, body)) = self.injected.write().pop_front() {
            return error(status, body);
        }

        let Some((resource, last)) = path.rsplit_once('/') else {
            return error(404, ErrorBody::new(404, "not found"));
        };
        if !resource.ends_with("/events") {
            return error(404, ErrorBody::new(404, format!("no route for {}", path)));
        }

        match last {
            "latest" => self.handle_latest(resource),
            since => self.handle_events(resource, since),
        }
    }
}

fn respond(body: evsync_protocol::ProtocolResult<Vec<u8>>) -> HttpResponse {
    match body {
        Ok(body) => HttpResponse::new(200, body),
        Err(e) => error(500, ErrorBody::new(500, e.to_string())),
    }
}

fn error(status: u16, body: ErrorBody) -> HttpResponse {
    HttpResponse::new(status, body.encode().unwrap_or_default())
}
