//! Line-delimited JSON protocol. Each request is one JSON object on one line
//! with an `op` field; each reply is one line of `{"ok":true,"data":..}` or
//! `{"ok":false,"error":{..}}`. Listening connections additionally receive
//! `{"notify":{..}}` lines for every event on the businesses they follow.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{
    AvailabilityQuery, BookingRequest, CommitRequest, Engine, EngineError, InventoryRequest, now_ms,
};
use crate::limits::{MAX_LINE_LEN, MAX_LISTENS_PER_CONNECTION};
use crate::model::*;
use crate::observability::{
    AUTH_FAILURES_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, request_label,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        token: String,
    },
    Ping,
    Availability {
        business_id: Ulid,
        date: String,
        #[serde(default)]
        service: Option<String>,
        #[serde(default)]
        inventory: Option<InventoryRequest>,
    },
    Commit {
        business_id: Ulid,
        booking: BookingRequest,
        customer: String,
    },
    SetStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelReservation {
        booking_id: Ulid,
    },
    Capacity {
        item_id: Ulid,
        start: NaiveDate,
        #[serde(default)]
        end: Option<NaiveDate>,
    },
    UpsertBusiness {
        business: BusinessProfile,
    },
    UpsertItem {
        item: InventoryItem,
    },
    Bookings {
        business_id: Ulid,
        #[serde(default)]
        start: Option<Ms>,
        #[serde(default)]
        end: Option<Ms>,
    },
    Listen {
        business_id: Ulid,
    },
    Unlisten {
        business_id: Ulid,
    },
}

impl Request {
    fn needs_auth(&self) -> bool {
        !matches!(self, Request::Auth { .. } | Request::Ping)
    }
}

/// Error body sent to clients. Protocol-level failures share the shape of
/// engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
}

impl WireError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            status: 400,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            code: "unauthorized",
            status: 401,
            message: "authenticate with {\"op\":\"auth\",\"token\":..} first".into(),
        }
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        Self {
            code: e.code(),
            status: e.status(),
            message: e.to_string(),
        }
    }
}

fn ok_line(data: Value) -> String {
    json!({ "ok": true, "data": data }).to_string()
}

fn err_line(error: &WireError) -> String {
    json!({ "ok": false, "error": error }).to_string()
}

fn to_value<T: Serialize>(data: &T) -> Result<Value, WireError> {
    serde_json::to_value(data).map_err(|e| WireError {
        code: "internal",
        status: 500,
        message: format!("encoding reply: {e}"),
    })
}

fn notify_line(event: &Event) -> String {
    json!({
        "notify": {
            "business_id": event.business_id(),
            "kind": event.kind(),
            "event": event,
        }
    })
    .to_string()
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(io::ErrorKind::InvalidData, "line too long"),
    }
}

// ── Session ──────────────────────────────────────────────────────

struct Session {
    engine: Arc<Engine>,
    token: Option<String>,
    authenticated: bool,
    listens: HashMap<Ulid, JoinHandle<()>>,
    notify_tx: mpsc::Sender<String>,
}

impl Session {
    fn new(engine: Arc<Engine>, token: Option<String>, notify_tx: mpsc::Sender<String>) -> Self {
        Self {
            engine,
            authenticated: token.is_none(),
            token,
            listens: HashMap::new(),
            notify_tx,
        }
    }

    /// Parse one line and produce the reply line.
    async fn handle_line(&mut self, line: &str) -> String {
        let started = Instant::now();
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => "invalid", "status" => "error").increment(1);
                return err_line(&WireError::bad_request(format!("malformed request: {e}")));
            }
        };
        let op = request_label(&request);

        let result = if request.needs_auth() && !self.authenticated {
            Err(WireError::unauthorized())
        } else {
            self.execute(request).await
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

        match result {
            Ok(data) => ok_line(data),
            Err(e) => {
                debug!("{op} failed: {} {}", e.code, e.message);
                err_line(&e)
            }
        }
    }

    async fn execute(&mut self, request: Request) -> Result<Value, WireError> {
        let engine = &self.engine;
        match request {
            Request::Auth { token } => {
                let expected = self.token.as_deref();
                if expected.is_none() || expected == Some(token.as_str()) {
                    self.authenticated = true;
                    Ok(json!({ "authenticated": true }))
                } else {
                    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                    warn!("rejected auth attempt");
                    Err(WireError::unauthorized())
                }
            }
            Request::Ping => Ok(json!("pong")),
            Request::Availability {
                business_id,
                date,
                service,
                inventory,
            } => {
                let query = AvailabilityQuery {
                    business_id,
                    date,
                    service,
                    inventory,
                };
                let report = engine.query_availability(&query).await?;
                to_value(&report)
            }
            Request::Commit {
                business_id,
                booking,
                customer,
            } => {
                let outcome = engine
                    .commit_booking(CommitRequest {
                        business_id,
                        booking,
                        customer,
                    })
                    .await?;
                to_value(&outcome)
            }
            Request::SetStatus { booking_id, status } => {
                let booking = engine.set_booking_status(booking_id, status).await?;
                to_value(&booking)
            }
            Request::CancelReservation { booking_id } => {
                let booking = engine.release_reservation(booking_id).await?;
                to_value(&booking)
            }
            Request::Capacity { item_id, start, end } => {
                let range = DateRange::new(start, end);
                let remaining = engine.remaining_capacity(item_id, range).await?;
                Ok(json!({
                    "item_id": item_id,
                    "range": range,
                    "remaining": remaining,
                    "as_of": now_ms(),
                }))
            }
            Request::UpsertBusiness { business } => {
                let id = business.id;
                engine.upsert_business(business).await?;
                Ok(json!({ "business_id": id }))
            }
            Request::UpsertItem { item } => {
                let id = item.id;
                engine.upsert_item(item).await?;
                Ok(json!({ "item_id": id }))
            }
            Request::Bookings { business_id, start, end } => {
                let within = match (start, end) {
                    (None, None) => None,
                    (Some(s), Some(e)) => Some(
                        Span::try_new(s, e)
                            .ok_or_else(|| WireError::bad_request("bookings window must have start < end"))?,
                    ),
                    _ => return Err(WireError::bad_request("bookings window needs both start and end")),
                };
                let view = engine.list_bookings(business_id, within).await?;
                to_value(&view)
            }
            Request::Listen { business_id } => {
                engine.get_business(business_id).await?;
                self.listen(business_id)?;
                Ok(json!({ "listening": business_id }))
            }
            Request::Unlisten { business_id } => {
                let was_listening = match self.listens.remove(&business_id) {
                    Some(handle) => {
                        handle.abort();
                        true
                    }
                    None => false,
                };
                Ok(json!({ "unlistened": business_id, "was_listening": was_listening }))
            }
        }
    }

    fn listen(&mut self, business_id: Ulid) -> Result<(), WireError> {
        if self.listens.contains_key(&business_id) {
            return Ok(());
        }
        if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many listens on connection").into());
        }
        let mut rx = self.engine.notify.subscribe(business_id);
        let tx = self.notify_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(notify_line(&event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener on {business_id} lagged, skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listens.insert(business_id, handle);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.listens.drain() {
            handle.abort();
        }
    }
}

// ── Connection loop ──────────────────────────────────────────────

/// Serve one client until it disconnects. Replies are sent in request order;
/// notifications are interleaved between replies.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>, token: Option<String>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(256);
    let mut session = Session::new(engine, token, notify_tx);

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None => break,
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = session.handle_line(&line).await;
                    framed.send(reply).await.map_err(codec_err)?;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    metrics::counter!(REQUESTS_TOTAL, "op" => "invalid", "status" => "error").increment(1);
                    let reply = err_line(&WireError::bad_request(format!(
                        "request exceeds {MAX_LINE_LEN} bytes"
                    )));
                    framed.send(reply).await.map_err(codec_err)?;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
            },
            Some(line) = notify_rx.recv() => {
                framed.send(line).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_op() {
        let id = Ulid::new();
        let cases = [
            json!({ "op": "auth", "token": "t" }),
            json!({ "op": "ping" }),
            json!({ "op": "availability", "business_id": id, "date": "2030-03-04" }),
            json!({
                "op": "commit",
                "business_id": id,
                "customer": "c@example.com",
                "booking": { "kind": "appointment", "start": 1_900_000_000_000i64 }
            }),
            json!({ "op": "set_status", "booking_id": id, "status": "cancelled" }),
            json!({ "op": "cancel_reservation", "booking_id": id }),
            json!({ "op": "capacity", "item_id": id, "start": "2030-03-04" }),
            json!({ "op": "bookings", "business_id": id }),
            json!({ "op": "listen", "business_id": id }),
            json!({ "op": "unlisten", "business_id": id }),
        ];
        let labels: Vec<&str> = cases
            .iter()
            .map(|v| request_label(&serde_json::from_value::<Request>(v.clone()).unwrap()))
            .collect();
        assert_eq!(
            labels,
            [
                "auth",
                "ping",
                "availability",
                "commit",
                "set_status",
                "cancel_reservation",
                "capacity",
                "bookings",
                "listen",
                "unlisten"
            ]
        );
    }

    #[test]
    fn reservation_commit_defaults_quantity() {
        let id = Ulid::new();
        let req: Request = serde_json::from_value(json!({
            "op": "commit",
            "business_id": id,
            "customer": "c",
            "booking": { "kind": "reservation", "item_id": id, "range": { "start": "2030-03-04", "end": null } }
        }))
        .unwrap();
        let Request::Commit { booking: BookingRequest::Reservation { quantity, .. }, .. } = req else {
            panic!("expected reservation commit");
        };
        assert_eq!(quantity, 1);
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_tables"}"#).is_err());
    }

    #[test]
    fn only_auth_and_ping_skip_the_token() {
        assert!(!Request::Ping.needs_auth());
        assert!(!Request::Auth { token: "x".into() }.needs_auth());
        assert!(Request::Listen { business_id: Ulid::new() }.needs_auth());
    }

    #[test]
    fn engine_errors_keep_code_and_status() {
        let e: WireError = EngineError::NotFound(Ulid::nil()).into();
        assert_eq!(e.code, "not_found");
        assert_eq!(e.status, 404);
        let line: Value = serde_json::from_str(&err_line(&e)).unwrap();
        assert_eq!(line["ok"], false);
        assert_eq!(line["error"]["code"], "not_found");
    }
}
