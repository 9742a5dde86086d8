//! Per-request relay: backend output back to the front-facing connection.

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::Event;
use crate::backend::BackendLease;
use crate::protocol::{EndResult, RecordType};
use crate::writer::WriterHandle;

/// Everything a relay needs besides the lease.
pub(super) struct RelayTarget {
    pub front_id: u16,
    pub seq: u64,
    pub front: WriterHandle,
    /// Closes (sender dropped) when the front-facing connection goes away.
    pub front_open: watch::Receiver<()>,
    pub events: mpsc::UnboundedSender<Event>,
    pub response_timeout: Duration,
}

/// Forward stdout/stderr re-headed with the front id until the backend
/// ends the request, then report the result.
///
/// Runs to the backend's end-request even after the front is gone, so the
/// backend slot is released only once the backend is done with the id.
/// A failed front write loses output, so the bridge is told to end the
/// request and the rest of the backend's output is discarded.
pub(super) async fn relay(mut lease: BackendLease, target: RelayTarget) {
    let RelayTarget {
        front_id,
        seq,
        front,
        mut front_open,
        events,
        response_timeout,
    } = target;
    let mut front = Some(front);

    let result = loop {
        tokio::select! {
            changed = front_open.changed(), if front.is_some() => {
                if changed.is_err() {
                    front = None;
                }
                continue;
            }
            received = tokio::time::timeout(response_timeout, lease.recv()) => {
                let frame = match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break EndResult::overloaded(),
                    Err(_) => {
                        tracing::warn!(
                            "Backend request {} (front {}) silent for {:?}, aborting",
                            lease.backend_id(),
                            front_id,
                            response_timeout
                        );
                        let _ = lease.abort().await;
                        break EndResult::overloaded();
                    }
                };

                match frame.kind() {
                    Some(RecordType::Stdout | RecordType::Stderr) => {
                        let Some(writer) = &front else {
                            continue;
                        };
                        if let Err(error) = writer.send_frame(frame.with_request_id(front_id)).await {
                            tracing::warn!(
                                "Output for front request {} not delivered: {}",
                                front_id,
                                error
                            );
                            front = None;
                            let _ = events.send(Event::FrontStalled {
                                id: front_id,
                                seq,
                                error,
                            });
                        }
                    }
                    Some(RecordType::EndRequest) => match EndResult::decode(frame.content()) {
                        Ok(result) => break result,
                        Err(e) => {
                            tracing::warn!("Bad end-request from backend for front {}: {}", front_id, e);
                            break EndResult::overloaded();
                        }
                    },
                    _ => {
                        tracing::debug!(
                            "Ignoring record type {} from backend for front {}",
                            frame.header.record_type,
                            front_id
                        );
                    }
                }
            }
        }
    };

    // free the backend slot before the bridge answers the front
    drop(lease);
    drop(front);
    let _ = events.send(Event::Completed {
        id: front_id,
        seq,
        result,
    });
}
