//! Worker pools for the five streams.
//!
//! Each stream is a pool of long-running tasks consuming one bus channel and
//! publishing downstream. Workers log-and-continue on application errors;
//! only shutdown (channel closed or token cancelled) ends a loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kobzar_bus::StreamBus;
use kobzar_core::config::StreamsConfig;
use kobzar_core::metrics;
use kobzar_core::types::{GateDepth, InboundEvent, PlanningJob, TriageJob};
use kobzar_graph::{GraphStore, PersistOutcome};

use crate::analyst::Analyst;
use crate::context::PipelineContext;
use crate::coordinator::{Coordinator, WebSearch};
use crate::gatekeeper::Gatekeeper;
use crate::responder::{OutboundSink, Responder};
use crate::thinker::Thinker;

/// Graph write retry budget for the Scribe.
const PERSIST_MAX_ATTEMPTS: u32 = 5;
/// First retry delay.
const PERSIST_BACKOFF_BASE_MS: u64 = 100;
/// Jitter fraction applied to each retry delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Spawn every stream's worker pool. Returned handles finish once `shutdown`
/// fires and the queues drain.
pub fn spawn_streams(
    ctx: Arc<PipelineContext>,
    bus: Arc<StreamBus>,
    sink: Arc<dyn OutboundSink>,
    web: Option<Arc<dyn WebSearch>>,
    streams: &StreamsConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let gatekeeper = Arc::new(Gatekeeper::new(ctx.clone()));
    let thinker = Arc::new(Thinker::new(ctx.clone()));
    let analyst = Arc::new(Analyst::new(ctx.clone()));
    let coordinator = Coordinator::new(ctx.clone(), web);
    let responder = Arc::new(Responder::new(ctx.clone(), sink));

    let mut handles = Vec::new();

    for worker in 0..streams.scribe.workers.max(1) {
        handles.push(spawn_scribe_ingestion(
            worker,
            ctx.store.clone(),
            bus.clone(),
            shutdown.clone(),
        ));
        handles.push(spawn_scribe_enrichment(
            worker,
            ctx.store.clone(),
            bus.clone(),
            shutdown.clone(),
        ));
    }

    for worker in 0..streams.gatekeeper.workers.max(1) {
        let gatekeeper = gatekeeper.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let rx = bus.triage.receiver();
            info!(worker, "gatekeeper worker started");
            loop {
                let job: TriageJob = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                };
                let uid = job.message_uid;
                match gatekeeper.triage(uid).await {
                    Ok((verdict, _message)) => {
                        if verdict.is_skip() {
                            debug!(%uid, "gate verdict: skip");
                            continue;
                        }
                        let job = PlanningJob {
                            message_uid: uid,
                            narrative: String::new(),
                            gate_decision: verdict,
                        };
                        let publish = match verdict.required_depth {
                            GateDepth::QuickReply => bus.planning.publish(job).await,
                            GateDepth::DeepAnalysis => bus.analysis.publish(job).await,
                            GateDepth::Skip => Ok(()),
                        };
                        if let Err(e) = publish {
                            warn!(%uid, error = %e, "failed to publish gate decision");
                        }
                    }
                    Err(e) => error!(%uid, error = %e, "gatekeeper stage failed"),
                }
            }
            info!(worker, "gatekeeper worker stopped");
        }));
    }

    for worker in 0..streams.thinker.workers.max(1) {
        let thinker = thinker.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let rx = bus.analysis.receiver();
            info!(worker, "thinker worker started");
            loop {
                let job: PlanningJob = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                };
                let uid = job.message_uid;
                match thinker.analyze(uid).await {
                    Ok(enrichment) => {
                        let narrative = enrichment.narrative.clone();
                        let has_content = !enrichment.topics.is_empty()
                            || !enrichment.entities.is_empty()
                            || !enrichment.narrative.is_empty();
                        if has_content {
                            if let Err(e) = bus.enrichment.publish(enrichment).await {
                                // Enrichment is the first channel to shed; the
                                // plan must go on regardless.
                                warn!(%uid, error = %e, "enrichment not published");
                            }
                        }
                        let planning = PlanningJob {
                            message_uid: uid,
                            narrative,
                            gate_decision: job.gate_decision,
                        };
                        if let Err(e) = bus.planning.publish(planning).await {
                            warn!(%uid, error = %e, "failed to publish planning job");
                        }
                    }
                    Err(e) => error!(%uid, error = %e, "thinker stage failed"),
                }
            }
            info!(worker, "thinker worker stopped");
        }));
    }

    for worker in 0..streams.analyst.workers.max(1) {
        let analyst = analyst.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let rx = bus.planning.receiver();
            info!(worker, "analyst worker started");
            loop {
                let job: PlanningJob = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(job) => job,
                        Err(_) => break,
                    },
                };
                let uid = job.message_uid;
                match analyst.plan(job).await {
                    Ok(snapshot) => {
                        if let Err(e) = bus.execution.publish(snapshot).await {
                            warn!(%uid, error = %e, "failed to publish snapshot");
                        }
                    }
                    Err(e) => error!(%uid, error = %e, "analyst stage failed"),
                }
            }
            info!(worker, "analyst worker stopped");
        }));
    }

    for worker in 0..streams.coordinator.workers.max(1) {
        let coordinator = coordinator.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let rx = bus.execution.receiver();
            info!(worker, "coordinator worker started");
            loop {
                let snapshot = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(snapshot) => snapshot,
                        Err(_) => break,
                    },
                };
                let uid = snapshot.msg_uid;
                if let Some(bundle) = coordinator.execute(snapshot).await {
                    if let Err(e) = bus.response.publish(bundle).await {
                        warn!(%uid, error = %e, "failed to publish bundle");
                    }
                }
            }
            info!(worker, "coordinator worker stopped");
        }));
    }

    for worker in 0..streams.responder.workers.max(1) {
        let responder = responder.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let rx = bus.response.receiver();
            info!(worker, "responder worker started");
            loop {
                let bundle = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(bundle) => bundle,
                        Err(_) => break,
                    },
                };
                match responder.respond(bundle).await {
                    Ok(Some(loopback)) => {
                        // Close the feedback loop: the agent's reply becomes
                        // an ingestion event like everyone else's.
                        if let Err(e) = bus.ingestion.publish(loopback).await {
                            warn!(error = %e, "failed to loop reply back into ingestion");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "responder stage failed"),
                }
            }
            info!(worker, "responder worker stopped");
        }));
    }

    handles
}

fn spawn_scribe_ingestion(
    worker: usize,
    store: Arc<GraphStore>,
    bus: Arc<StreamBus>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rx = bus.ingestion.receiver();
        info!(worker, "scribe ingestion worker started");
        loop {
            let event: InboundEvent = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match persist_with_retry(&store, &event).await {
                Some(outcome) if outcome.created => {
                    debug!(uid = %outcome.uid, label = %outcome.label, "persisted");
                    let job = TriageJob {
                        message_uid: outcome.uid,
                    };
                    if let Err(e) = bus.triage.publish(job).await {
                        warn!(uid = %outcome.uid, error = %e, "failed to publish triage job");
                    }
                }
                // Redelivered duplicate: already triaged the first time.
                Some(_) => {}
                None => {
                    metrics::incr(metrics::names::MESSAGES_UNPERSISTED_TOTAL);
                    error!(
                        chat_id = event.chat_id,
                        message_id = event.message_id,
                        "message unpersisted after retries"
                    );
                }
            }
        }
        info!(worker, "scribe ingestion worker stopped");
    })
}

fn spawn_scribe_enrichment(
    worker: usize,
    store: Arc<GraphStore>,
    bus: Arc<StreamBus>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rx = bus.enrichment.receiver();
        info!(worker, "scribe enrichment worker started");
        loop {
            let enrichment = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(enrichment) => enrichment,
                    Err(_) => break,
                },
            };
            if let Err(e) = store.enrich(&enrichment).await {
                warn!(uid = %enrichment.msg_uid, error = %e, "enrichment write failed");
            }
        }
        info!(worker, "scribe enrichment worker stopped");
    })
}

/// Persist with exponential backoff and jitter. Transient graph errors are
/// retried up to [`PERSIST_MAX_ATTEMPTS`]; anything else gives up at once.
async fn persist_with_retry(store: &GraphStore, event: &InboundEvent) -> Option<PersistOutcome> {
    let mut delay_ms = PERSIST_BACKOFF_BASE_MS;
    for attempt in 1..=PERSIST_MAX_ATTEMPTS {
        match store.persist(event).await {
            Ok(outcome) => return Some(outcome),
            Err(e) if e.is_transient() && attempt < PERSIST_MAX_ATTEMPTS => {
                let total = delay_ms + jitter_ms(delay_ms);
                warn!(
                    chat_id = event.chat_id,
                    message_id = event.message_id,
                    attempt,
                    retry_after_ms = total,
                    error = %e,
                    "persist failed, retrying"
                );
                sleep(Duration::from_millis(total)).await;
                delay_ms *= 2;
            }
            Err(e) => {
                error!(
                    chat_id = event.chat_id,
                    message_id = event.message_id,
                    attempt,
                    error = %e,
                    "persist failed"
                );
                return None;
            }
        }
    }
    None
}

/// Jitter offset (0 … `JITTER_FRACTION * base_ms`) derived from the monotonic
/// clock's sub-second noise, avoiding a rand dependency.
fn jitter_ms(base_ms: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = ((base_ms as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_fraction() {
        for _ in 0..100 {
            assert!(jitter_ms(1000) <= 100);
        }
        assert_eq!(jitter_ms(1), 0);
    }
}
