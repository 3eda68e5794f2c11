//! JSON-lines front-end
//!
//! Reads one request per line and writes one line per reply or event:
//!
//! ```text
//! > {"id": 1, "verb": "call", "args": {"path": "/org/x", "member": "Ping"}}
//! < {"id": 1, "status": "success", "code": 0, "data": []}
//! < {"event": "default", "data": {"bus": "system", "status": "success", ...}}
//! ```
//!
//! Replies are written as they complete, so they may come out of order;
//! `id` is echoed back verbatim. At end of input the outstanding replies
//! are drained before returning.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeClient, PendingReply};
use crate::error::{BridgeError, Result};
use crate::host::{DeliveredEvent, EventReceiver};
use crate::protocol::{Reply, Verb};

#[derive(Debug, Deserialize)]
struct RequestLine {
    #[serde(default)]
    id: Value,
    verb: String,
    #[serde(default = "empty_args")]
    args: Value,
}

fn empty_args() -> Value {
    json!({})
}

/// Serialize a reply line
pub fn reply_line(id: &Value, reply: &Reply) -> Value {
    json!({
        "id": id,
        "status": reply.status.as_str(),
        "code": reply.status.code(),
        "data": reply.data.clone().unwrap_or(Value::Null),
    })
}

/// Serialize an event line
pub fn event_line(event: &DeliveredEvent) -> Value {
    json!({
        "event": event.event,
        "data": event.data,
    })
}

/// Parse one input line and submit it
fn submit_line(client: &BridgeClient, line: &str) -> (Value, Result<PendingReply>) {
    let request: RequestLine = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            // keep the id if the line is at least a JSON object carrying one
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(Value::Null);
            return (id, Err(BridgeError::from(e)));
        }
    };
    let pending = request
        .verb
        .parse::<Verb>()
        .and_then(|verb| client.submit(verb, &request.args));
    (request.id, pending)
}

async fn write_line<W>(output: &mut W, value: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(value).map_err(|e| BridgeError::Internal(e.to_string()))?;
    bytes.push(b'\n');
    output.write_all(&bytes).await?;
    output.flush().await?;
    Ok(())
}

/// Serve requests from `input` until it ends, writing replies and events to
/// `output`
pub async fn serve<R, W>(
    client: BridgeClient,
    mut events: EventReceiver,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut pending = FuturesUnordered::new();
    let mut input_open = true;
    let mut served = 0usize;

    info!(client = %client.subscriber(), "Front-end serving");
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    served += 1;
                    let (id, submitted) = submit_line(&client, &line);
                    match submitted {
                        Ok(reply) => pending.push(async move { (id, reply.wait().await) }),
                        Err(e) => {
                            debug!(error = %e, "Request rejected");
                            write_line(&mut output, &reply_line(&id, &Reply::from_error(&e))).await?;
                        }
                    }
                }
                None => {
                    debug!("End of input");
                    input_open = false;
                }
            },
            Some((id, reply)) = pending.next() => {
                write_line(&mut output, &reply_line(&id, &reply)).await?;
            }
            Some(event) = events.recv() => {
                write_line(&mut output, &event_line(&event)).await?;
            }
            else => break,
        }

        if !input_open && pending.is_empty() {
            break;
        }
    }

    // events that arrived alongside the last replies
    while let Some(event) = events.try_recv() {
        write_line(&mut output, &event_line(&event)).await?;
    }

    if !client.is_running() {
        warn!("Dispatch loop stopped while serving");
    }
    info!(served, "Front-end finished");
    Ok(())
}
