//! The named channels connecting the five streams.
//!
//! Push-based dataflow: every stage consumes exactly one channel and
//! publishes to the next one(s). Capacities come from the consuming stream's
//! `queue_capacity` config.

use kobzar_core::config::StreamsConfig;
use kobzar_core::metrics;
use kobzar_core::types::{
    AnalystSnapshot, ContextBundle, Enrichment, InboundEvent, PlanningJob, TriageJob,
};

use crate::queue::{PublishPolicy, Queue};

/// Enrichment is the first channel to shed under pressure.
const ENRICHMENT_MAX_ATTEMPTS: u32 = 5;
/// Everything except `ingestion` sheds eventually rather than wedging a stage.
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// All queues of the cognitive pipeline.
///
/// | Channel      | Producer              | Consumer    |
/// |--------------|-----------------------|-------------|
/// | `ingestion`  | transport, Responder  | Scribe      |
/// | `triage`     | Scribe                | Gatekeeper  |
/// | `analysis`   | Gatekeeper            | Thinker     |
/// | `enrichment` | Thinker               | Scribe      |
/// | `planning`   | Gatekeeper or Thinker | Analyst     |
/// | `execution`  | Analyst               | Coordinator |
/// | `response`   | Coordinator           | Responder   |
pub struct StreamBus {
    pub ingestion: Queue<InboundEvent>,
    pub triage: Queue<TriageJob>,
    pub analysis: Queue<PlanningJob>,
    pub enrichment: Queue<Enrichment>,
    pub planning: Queue<PlanningJob>,
    pub execution: Queue<AnalystSnapshot>,
    pub response: Queue<ContextBundle>,
}

impl StreamBus {
    pub fn new(streams: &StreamsConfig) -> Self {
        let sheddable = PublishPolicy::Sheddable {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        Self {
            // Raw events are never dropped — producers block at the cap instead.
            ingestion: Queue::bounded(
                "ingestion",
                streams.scribe.queue_capacity,
                PublishPolicy::Persistent,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
            triage: Queue::bounded(
                "triage",
                streams.gatekeeper.queue_capacity,
                sheddable,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
            analysis: Queue::bounded(
                "analysis",
                streams.thinker.queue_capacity,
                sheddable,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
            enrichment: Queue::bounded(
                "enrichment",
                streams.scribe.queue_capacity,
                PublishPolicy::Sheddable {
                    max_attempts: ENRICHMENT_MAX_ATTEMPTS,
                },
                metrics::names::ENRICHMENT_SHED_TOTAL,
            ),
            planning: Queue::bounded(
                "planning",
                streams.analyst.queue_capacity,
                sheddable,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
            execution: Queue::bounded(
                "execution",
                streams.coordinator.queue_capacity,
                sheddable,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
            response: Queue::bounded(
                "response",
                streams.responder.queue_capacity,
                sheddable,
                metrics::names::QUEUE_SHED_TOTAL,
            ),
        }
    }

    /// Close every channel. Consumers drain and exit.
    pub fn close_all(&self) {
        self.ingestion.close();
        self.triage.close();
        self.analysis.close();
        self.enrichment.close();
        self.planning.close();
        self.execution.close();
        self.response.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kobzar_core::types::{ChatKind, EventSource, MessageUid};

    fn event(chat_id: i64, message_id: i64) -> InboundEvent {
        InboundEvent {
            chat_id,
            message_id,
            source: EventSource::User,
            sender_id: 42,
            sender_name: Some("tester".into()),
            username: None,
            chat_kind: ChatKind::Private,
            chat_title: None,
            text: "hello".into(),
            timestamp: 1_738_670_000.0,
            media: None,
        }
    }

    #[tokio::test]
    async fn channels_route_their_payloads() {
        let bus = StreamBus::new(&StreamsConfig::default());

        bus.ingestion.publish(event(1, 100)).await.unwrap();
        let got = bus.ingestion.receiver().recv().await.unwrap();
        assert_eq!(got.uid(), MessageUid::new(1, 100));

        bus.triage
            .publish(TriageJob {
                message_uid: MessageUid::new(1, 100),
            })
            .await
            .unwrap();
        assert_eq!(
            bus.triage.receiver().recv().await.unwrap().message_uid,
            MessageUid::new(1, 100)
        );
    }

    #[tokio::test]
    async fn close_all_terminates_consumers() {
        let bus = StreamBus::new(&StreamsConfig::default());
        let rx = bus.triage.receiver();
        bus.close_all();
        assert!(rx.recv().await.is_err());
    }
}
