//! Line-oriented request driver.
//!
//! Each input line is one JSON request; each produces exactly one JSON
//! response line:
//!
//! - an order submission (`{"order_id":"O1","tier":"Vip","items":[...]}`)
//!   is admitted and answered with the admission result
//! - `{"cancel":"O1"}` requests cancellation
//! - `{"status":"O1"}` returns the saga snapshot

use common::OrderId;
use saga::{OrderSubmission, Orchestrator};
use serde::Deserialize;
use serde_json::{Value, json};
use store::KeyValueStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Cancel { cancel: OrderId },
    Status { status: OrderId },
    Submit(OrderSubmission),
}

/// Serves requests from `input` until it is exhausted. Returns the number
/// of lines handled.
pub async fn run<S, R, W>(orchestrator: &Orchestrator<S>, input: R, mut output: W) -> Result<usize>
where
    S: KeyValueStore + Clone,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = respond(orchestrator, line).await;
        output.write_all(response.to_string().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        handled += 1;
    }

    Ok(handled)
}

async fn respond<S: KeyValueStore + Clone>(orchestrator: &Orchestrator<S>, line: &str) -> Value {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "malformed request");
            metrics::counter!("driver_requests_total", "kind" => "malformed").increment(1);
            return json!({ "error": format!("malformed request: {e}") });
        }
    };

    let kind = match &request {
        Request::Submit(_) => "submit",
        Request::Cancel { .. } => "cancel",
        Request::Status { .. } => "status",
    };
    metrics::counter!("driver_requests_total", "kind" => kind).increment(1);

    let result = match request {
        Request::Submit(submission) => orchestrator
            .admit(submission)
            .await
            .map(|admission| json!(admission)),
        Request::Cancel { cancel } => orchestrator
            .request_cancel(&cancel)
            .await
            .map(|()| json!({ "order_id": cancel, "cancel": "requested" })),
        Request::Status { status } => orchestrator.snapshot(&status).await.map(|snapshot| {
            snapshot.map_or_else(
                || json!({ "order_id": status, "error": "order not found" }),
                |snapshot| json!(snapshot),
            )
        }),
    };

    result.unwrap_or_else(|e| json!({ "error": e.to_string() }))
}
