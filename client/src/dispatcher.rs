//! Tunnel event dispatcher
//!
//! The state machine behind `handle`: every inbound envelope either
//! refreshes liveness, starts a forwarding pipeline, or cancels one.
//! There is no dispatcher state beyond the correlation cache; pipelines
//! run on the request pool, never on the socket's event loop.

use burrow_shared::{Envelope, Event};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::CorrelationCache;
use crate::forwarder::HttpForwarder;
use crate::pool::Pools;
use crate::session::SessionHandle;

pub struct EventDispatcher {
    cache: Arc<CorrelationCache>,
    forwarder: Arc<HttpForwarder>,
    pools: Arc<Pools>,
}

impl EventDispatcher {
    pub fn new(cache: Arc<CorrelationCache>, forwarder: Arc<HttpForwarder>, pools: Arc<Pools>) -> Self {
        Self { cache, forwarder, pools }
    }

    /// Entry point for decoded inbound envelopes. Fire-and-forget: all
    /// effects flow through [`SessionHandle::send`] and logging.
    pub fn handle(&self, session: &SessionHandle, envelope: Envelope) {
        info!(
            session = %session.id(),
            event = ?envelope.event,
            request_id = envelope.request_id.as_deref().unwrap_or(""),
            "received"
        );

        match envelope.event {
            Event::ServerPong => {
                let cache = self.cache.clone();
                self.pools.liveness.spawn(async move {
                    cache.mark_liveness();
                });
            }
            Event::ServerRequest => {
                // A peer issuing requests is alive, ping or no ping
                self.cache.mark_liveness();
                self.start_pipeline(session.clone(), envelope);
            }
            Event::ServerRequestAck => match envelope.request_id.as_deref() {
                Some(id) => self.cache.acknowledge(id),
                None => warn!(session = %session.id(), "SERVER_REQUEST_ACK without request id"),
            },
            // Outbound-only kinds echoed back at us
            _ => {}
        }
    }

    fn start_pipeline(&self, session: SessionHandle, envelope: Envelope) {
        let Some(request_id) = envelope.request_id.clone().filter(|id| !id.is_empty()) else {
            warn!(session = %session.id(), "SERVER_REQUEST without request id, dropping");
            return;
        };

        let cancel = CancellationToken::new();
        // Track before forwarding begins so an ack arriving mid-flight
        // can always reach the pipeline
        let seq = self.cache.track(&request_id, cancel.clone());

        let cache = self.cache.clone();
        let forwarder = self.forwarder.clone();
        let pipeline_session = session.clone();
        let terminal = envelope.respond_end();
        let id = request_id.clone();
        let accepted = self.pools.request.spawn(async move {
            run_pipeline(&pipeline_session, &envelope, &forwarder, cancel).await;
            cache.complete(&id, seq);
        });

        if !accepted {
            // Shed load: the pipeline never ran, so its entry must not
            // outlive it, and the peer still gets a terminal marker
            self.cache.complete(&request_id, seq);
            tokio::spawn(async move {
                session.send(terminal).await;
            });
        }
    }
}

/// Forward the request and stream every produced payload back as a
/// `CLIENT_RESPOND`, closing with exactly one `CLIENT_RESPOND_END` on
/// natural completion. A cancellation (server ack) stops the stream
/// silently instead.
async fn run_pipeline(
    session: &SessionHandle,
    envelope: &Envelope,
    forwarder: &HttpForwarder,
    cancel: CancellationToken,
) {
    let request_payload = envelope.payload.clone().unwrap_or_default();

    match forwarder.forward(request_payload, cancel.clone()) {
        Ok((driver, mut chunks)) => {
            // The origin exchange and the outbound stream share this one
            // task: the driver is polled here, not on a pool of its own,
            // so a request never waits on a second permit.
            tokio::pin!(driver);
            let mut driving = true;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = &mut driver, if driving => driving = false,
                    chunk = chunks.recv() => match chunk {
                        Some(payload) => session.send(envelope.respond(payload)).await,
                        None => break,
                    }
                }
            }
            session.send(envelope.respond_end()).await;
        }
        Err(err) => {
            // Malformed request: no origin call happened, but the peer
            // still gets its terminal marker
            warn!(
                session = %session.id(),
                request_id = envelope.request_id.as_deref().unwrap_or(""),
                error = %err,
                "rejecting malformed request"
            );
            session.send(envelope.respond_end()).await;
        }
    }
}
