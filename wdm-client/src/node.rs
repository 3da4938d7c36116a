//! Node dispatcher.
//!
//! [`WdmNode`] is the single work queue of a device: it owns the event log,
//! the timer table, the trait catalog, the subscription engine and the bulk
//! offload client, and is the only place that touches them. Everything runs
//! on one task; shared state is `Rc<RefCell<..>>` and no borrow outlives a
//! call into a component.

use std::cell::{Ref, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wdm_core::{
    Clock, EventLog, ExchangeAllocator, FrameWriter, LogOptions, LoggingState, SystemClock,
    TimerId, Timers, TraitDataSource,
};
use wdm_types::{Envelope, EventId, EventSchema, NodeId, TraitInstance};

use crate::catalog::TraitCatalog;
use crate::config::Config;
use crate::engine::{AutoAccept, EngineSettings, SubscriptionEngine};
use crate::error::ClientError;
use crate::offload::{BulkOffloadClient, OffloadOutcome, OffloadSettings};
use crate::store::FileCounterStore;
use crate::transport::{Transport, TransportError};

/// Longest sleep of [`WdmNode::run`] when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// A device: event log, subscriptions and offload behind one dispatcher.
pub struct WdmNode {
    node_id: NodeId,
    collector: Option<NodeId>,
    log: Rc<RefCell<EventLog>>,
    timers: Rc<RefCell<Timers>>,
    catalog: Rc<TraitCatalog>,
    subscriptions: SubscriptionEngine,
    offload: BulkOffloadClient,
    outcomes: Vec<OffloadOutcome>,
}

impl WdmNode {
    /// Build a node from configuration, timestamping events with the system
    /// clock.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        Self::with_clock(config, Box::new(SystemClock::new()))
    }

    /// Build a node from configuration with an explicit clock.
    pub fn with_clock(config: &Config, clock: Box<dyn Clock>) -> Result<Self, ClientError> {
        config.validate()?;

        let store = config
            .event_log
            .counter_file
            .as_ref()
            .map(FileCounterStore::new);
        let log = EventLog::new(config.tier_configs(store), config.log_settings(), clock)?;

        let log = Rc::new(RefCell::new(log));
        let timers = Rc::new(RefCell::new(Timers::new()));
        let exchanges = Rc::new(RefCell::new(ExchangeAllocator::default()));
        let catalog = Rc::new(TraitCatalog::new());

        let data: Rc<dyn TraitDataSource> = catalog.clone();
        let mut subscriptions = SubscriptionEngine::new(
            EngineSettings::from_config(config),
            log.clone(),
            timers.clone(),
            exchanges.clone(),
            data,
        );
        subscriptions.set_delegate(AutoAccept);

        let mut offload = BulkOffloadClient::new(
            OffloadSettings::from_config(config),
            log.clone(),
            timers.clone(),
            exchanges,
        );
        offload.init()?;

        let node_id = NodeId::new(config.node.node_id);
        info!(
            %node_id,
            tiers = config.event_log.tiers.len(),
            max_subscriptions = config.subscriptions.max_subscriptions,
            "node ready"
        );
        Ok(Self {
            node_id,
            collector: config.offload.collector.map(NodeId::new),
            log,
            timers,
            catalog,
            subscriptions,
            offload,
            outcomes: Vec::new(),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The event log.
    pub fn log(&self) -> Ref<'_, EventLog> {
        self.log.borrow()
    }

    /// The timer table.
    pub fn timers(&self) -> Ref<'_, Timers> {
        self.timers.borrow()
    }

    /// Published trait data.
    pub fn catalog(&self) -> &TraitCatalog {
        &self.catalog
    }

    /// The subscription engine.
    pub fn subscriptions(&mut self) -> &mut SubscriptionEngine {
        &mut self.subscriptions
    }

    /// The bulk offload client.
    pub fn offload(&mut self) -> &mut BulkOffloadClient {
        &mut self.offload
    }

    /// Collector for flush-triggered uploads.
    pub fn set_collector(&mut self, collector: Option<NodeId>) {
        self.collector = collector;
    }

    /// Log an event and schedule a flush if one is due. Subscribers see the
    /// event when the flush fires.
    pub fn log_event<F>(
        &mut self,
        schema: &EventSchema,
        options: &LogOptions,
        writer: F,
    ) -> Result<EventId, ClientError>
    where
        F: FnMut(&mut FrameWriter<'_>) -> io::Result<()>,
    {
        let id = self.log.borrow_mut().log_event(schema, options, writer)?;
        self.after_logging();
        Ok(id)
    }

    /// Log an event whose payload is `value` encoded as MessagePack.
    pub fn log_payload<T: Serialize>(
        &mut self,
        schema: &EventSchema,
        options: &LogOptions,
        value: &T,
    ) -> Result<EventId, ClientError> {
        let id = self.log.borrow_mut().log_payload(schema, options, value)?;
        self.after_logging();
        Ok(id)
    }

    /// Replace the data of a published trait instance and notify
    /// subscribers. Returns the new data version.
    pub fn update_trait(&mut self, instance: &TraitInstance, payload: Vec<u8>) -> Option<u64> {
        let version = self.catalog.update(instance, payload)?;
        self.subscriptions.notify_all();
        Some(version)
    }

    /// Ask for a flush even if the threshold is not reached.
    pub fn request_flush(&mut self) -> bool {
        self.log
            .borrow_mut()
            .schedule_flush_if_needed(&mut *self.timers.borrow_mut(), true)
    }

    /// Route an inbound envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        if envelope.destination != self.node_id {
            debug!(
                destination = %envelope.destination,
                kind = envelope.message.kind(),
                "dropping envelope for another node"
            );
            return Ok(());
        }
        if envelope.message.is_bdx() {
            if let Some(outcome) = self.offload.handle_envelope(envelope) {
                self.outcomes.push(outcome);
            }
            return Ok(());
        }
        self.subscriptions.handle_envelope(envelope)
    }

    /// Move time forward and handle every timer that expired.
    pub fn advance(&mut self, by: Duration) {
        let fired = self.timers.borrow_mut().advance(by);
        for timer in fired {
            if let Err(e) = self.on_timer(timer) {
                warn!(?timer, error = %e, "timer handling failed");
            }
        }
    }

    /// Handle one expired timer.
    pub fn on_timer(&mut self, timer: TimerId) -> Result<(), ClientError> {
        match timer {
            TimerId::Flush => self.on_flush(),
            TimerId::Holdoff => {
                self.log
                    .borrow_mut()
                    .on_holdoff_timer(&mut *self.timers.borrow_mut());
                let idle = self.log.borrow().state() == LoggingState::Idle;
                if idle && self.subscriptions.has_pending_events() {
                    debug!("subscribers still behind the log, flushing again");
                    self.request_flush();
                }
                Ok(())
            }
            TimerId::TransferTimeout => {
                if let Some(outcome) = self.offload.on_timeout() {
                    self.outcomes.push(outcome);
                }
                Ok(())
            }
            TimerId::Liveness(_) | TimerId::ResponseTimeout(_) => {
                self.subscriptions.on_timer(timer)
            }
        }
    }

    /// Time until the next armed timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.borrow().next_deadline()
    }

    /// Take every queued outbound envelope, subscriptions first.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        let mut outbound = self.subscriptions.take_outbound();
        outbound.extend(self.offload.take_outbound());
        outbound
    }

    /// Take the outcomes of uploads that ended since the last call.
    pub fn take_offload_outcomes(&mut self) -> Vec<OffloadOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Upload the log to `destination` now, over `transport`.
    pub async fn upload<T>(
        &mut self,
        transport: &T,
        destination: NodeId,
    ) -> Result<OffloadOutcome, ClientError>
    where
        T: Transport + ?Sized,
    {
        self.offload.run_upload(transport, destination).await
    }

    /// Send every queued outbound envelope.
    pub async fn pump<T>(&mut self, transport: &T) -> Result<usize, ClientError>
    where
        T: Transport + ?Sized,
    {
        let outbound = self.take_outbound();
        let count = outbound.len();
        for envelope in outbound {
            transport.send(&envelope.to_bytes()?).await?;
        }
        Ok(count)
    }

    /// Serve `transport` until it closes: send queued envelopes, handle
    /// inbound ones and fire timers against the tokio clock.
    pub async fn run<T>(&mut self, transport: &T) -> Result<(), ClientError>
    where
        T: Transport + ?Sized,
    {
        let mut last = Instant::now();
        loop {
            self.pump(transport).await?;

            let wait = self.next_deadline().unwrap_or(IDLE_WAIT).min(IDLE_WAIT);
            tokio::select! {
                received = transport.recv() => match received {
                    Ok(bytes) => match Envelope::from_bytes(&bytes) {
                        Ok(envelope) => {
                            if let Err(e) = self.handle_envelope(envelope) {
                                warn!(error = %e, "inbound envelope failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed envelope"),
                    },
                    Err(TransportError::ConnectionClosed) => {
                        info!(node_id = %self.node_id, "transport closed");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Instant::now();
            self.advance(now - last);
            last = now;
        }
    }

    /// Abort subscriptions and uploads and stop the log.
    pub fn shutdown(&mut self) {
        self.subscriptions.abort_all();
        self.offload.shutdown();
        self.log
            .borrow_mut()
            .shutdown(&mut *self.timers.borrow_mut());
        info!(node_id = %self.node_id, "node shut down");
    }

    fn after_logging(&mut self) {
        self.log
            .borrow_mut()
            .schedule_flush_if_needed(&mut *self.timers.borrow_mut(), false);
    }

    fn on_flush(&mut self) -> Result<(), ClientError> {
        if !self.log.borrow_mut().on_flush_timer() {
            return Ok(());
        }
        self.subscriptions.flush();
        match self.collector {
            Some(collector) if !self.offload.is_transferring() => {
                self.offload.start_upload(collector)
            }
            Some(_) => {
                debug!("flush while an upload is running");
                Ok(())
            }
            None => {
                debug!("flush due but no collector configured");
                self.log
                    .borrow_mut()
                    .upload_complete(&mut *self.timers.borrow_mut());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierSettings;
    use std::io::Write;
    use wdm_core::ManualClock;
    use wdm_types::{
        BlockEofAck, BlockQuery, ExchangeId, Importance, Message, SchemaVersionRange,
        SendAccept, SubscribeRequest, TraitPathRequest,
    };

    const DEVICE: u64 = 0x10;
    const COLLECTOR: NodeId = NodeId::new(0xC0);
    const PHONE: NodeId = NodeId::new(0x20);

    fn config() -> Config {
        let mut config = Config::default();
        config.node.node_id = DEVICE;
        config.event_log.tiers = vec![
            TierSettings {
                importance: Importance::Info,
                capacity_bytes: 2048,
            },
            TierSettings {
                importance: Importance::Production,
                capacity_bytes: 2048,
            },
        ];
        config.event_log.flush_threshold_bytes = 100;
        config.event_log.holdoff_ms = 1000;
        config
    }

    fn node(config: &Config) -> WdmNode {
        WdmNode::with_clock(config, Box::new(ManualClock::new(0))).unwrap()
    }

    fn emit(node: &mut WdmNode, payload: &[u8]) {
        node.log_event(
            &EventSchema::new(0x0A01, 1, Importance::Production),
            &LogOptions::new(),
            |w| w.write_all(payload),
        )
        .unwrap();
    }

    fn from_collector(envelope: &Envelope, message: Message) -> Envelope {
        envelope.reply(message)
    }

    #[test]
    fn flush_threshold_starts_upload_to_collector() {
        let mut config = config();
        config.offload.collector = Some(COLLECTOR.value());
        let mut node = node(&config);

        for _ in 0..4 {
            emit(&mut node, &[1u8; 40]);
        }
        assert!(node.timers().is_armed(TimerId::Flush));
        node.advance(Duration::ZERO);

        let outbound = node.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].destination, COLLECTOR);
        assert!(matches!(outbound[0].message, Message::SendInit(_)));
        assert_eq!(node.log().state(), LoggingState::InProgress);

        node.handle_envelope(from_collector(
            &outbound[0],
            Message::SendAccept(SendAccept { max_block_size: 0 }),
        ))
        .unwrap();
        node.handle_envelope(from_collector(
            &outbound[0],
            Message::BlockQuery(BlockQuery { block_counter: 0 }),
        ))
        .unwrap();
        let eof = node.take_outbound().remove(0);
        assert!(matches!(eof.message, Message::BlockEof(_)));
        node.handle_envelope(from_collector(
            &eof,
            Message::BlockEofAck(BlockEofAck { block_counter: 0 }),
        ))
        .unwrap();

        assert_eq!(node.take_offload_outcomes(), vec![OffloadOutcome::Done]);
        assert_eq!(node.log().state(), LoggingState::Holdoff);
        assert!(!node.timers().is_armed(TimerId::TransferTimeout));

        node.advance(Duration::from_millis(1000));
        assert_eq!(node.log().state(), LoggingState::Idle);
    }

    #[test]
    fn flush_without_collector_enters_holdoff() {
        let mut node = node(&config());
        assert!(node.request_flush());
        node.advance(Duration::ZERO);

        assert!(node.take_outbound().is_empty());
        assert_eq!(node.log().state(), LoggingState::Holdoff);
    }

    #[test]
    fn silent_collector_times_out_upload() {
        let mut config = config();
        config.offload.collector = Some(COLLECTOR.value());
        config.offload.response_timeout_ms = 500;
        let mut node = node(&config);

        node.request_flush();
        node.advance(Duration::ZERO);
        assert_eq!(node.take_outbound().len(), 1);

        node.advance(Duration::from_millis(500));
        assert!(matches!(
            node.take_offload_outcomes().as_slice(),
            [OffloadOutcome::Failed {
                reason: wdm_core::FailureReason::Timeout,
                ..
            }]
        ));
        assert!(!node.offload().is_transferring());
    }

    #[test]
    fn envelopes_for_other_nodes_are_dropped() {
        let mut node = node(&config());
        let stray = Envelope::new(
            ExchangeId::new(1),
            PHONE,
            NodeId::new(0x99),
            Message::SendAccept(SendAccept { max_block_size: 0 }),
        );
        node.handle_envelope(stray).unwrap();
        assert!(node.take_outbound().is_empty());
    }

    fn subscribe(node: &mut WdmNode) -> TraitInstance {
        let lock = TraitInstance::new(0x0E02, 9, 0);
        node.catalog()
            .register(lock, SchemaVersionRange::new(1, 1), vec![0]);

        let request = Envelope::new(
            ExchangeId::new(77),
            PHONE,
            node.node_id(),
            Message::SubscribeRequest(SubscribeRequest {
                paths: vec![TraitPathRequest {
                    instance: lock,
                    versions: SchemaVersionRange::new(1, 1),
                }],
                last_observed: Vec::new(),
                liveness_timeout_secs: None,
            }),
        );
        node.handle_envelope(request).unwrap();
        let notify = node.take_outbound().remove(0);
        ack(node, &notify);
        assert!(matches!(
            node.take_outbound().as_slice(),
            [Envelope {
                message: Message::SubscribeResponse(_),
                ..
            }]
        ));
        lock
    }

    fn ack(node: &mut WdmNode, notify: &Envelope) {
        node.handle_envelope(notify.reply(Message::StatusReport(
            wdm_types::StatusReport::success(),
        )))
        .unwrap();
    }

    fn notified_events(outbound: Vec<Envelope>) -> (Envelope, Vec<Vec<u8>>) {
        match &outbound[..] {
            [envelope @ Envelope {
                message: Message::Notify(notify),
                ..
            }] => (
                envelope.clone(),
                notify.events.iter().map(|e| e.payload.clone()).collect(),
            ),
            other => panic!("expected one Notify, got {other:?}"),
        }
    }

    #[test]
    fn trait_update_reaches_subscriber() {
        let mut node = node(&config());
        let lock = subscribe(&mut node);

        assert_eq!(node.update_trait(&lock, vec![1]), Some(2));
        match node.take_outbound().remove(0).message {
            Message::Notify(notify) => {
                assert_eq!(notify.data.len(), 1);
                assert_eq!(notify.data[0].payload, vec![1]);
            }
            other => panic!("expected Notify, got {other:?}"),
        }
    }

    #[test]
    fn subscribers_see_events_when_the_flush_fires() {
        let mut node = node(&config());
        subscribe(&mut node);

        emit(&mut node, b"open");
        assert!(!node.timers().is_armed(TimerId::Flush));
        assert!(node.take_outbound().is_empty());

        assert!(node.request_flush());
        node.advance(Duration::ZERO);
        let (notify, events) = notified_events(node.take_outbound());
        assert_eq!(events, vec![b"open".to_vec()]);
        assert_eq!(node.log().state(), LoggingState::Holdoff);

        ack(&mut node, &notify);
        assert!(node.take_outbound().is_empty());
        node.advance(Duration::from_millis(1000));
        assert_eq!(node.log().state(), LoggingState::Idle);
        assert!(!node.timers().is_armed(TimerId::Flush));
    }

    #[test]
    fn lagging_subscriber_is_flushed_again_after_holdoff() {
        let mut node = node(&config());
        subscribe(&mut node);

        emit(&mut node, b"first");
        node.request_flush();
        node.advance(Duration::ZERO);
        let (notify, _) = notified_events(node.take_outbound());

        emit(&mut node, b"second");
        ack(&mut node, &notify);
        assert!(node.take_outbound().is_empty());

        node.advance(Duration::from_millis(1000));
        assert!(node.timers().is_armed(TimerId::Flush));
        node.advance(Duration::ZERO);
        let (_, events) = notified_events(node.take_outbound());
        assert_eq!(events, vec![b"second".to_vec()]);
    }

    #[test]
    fn shutdown_stops_logging() {
        let mut node = node(&config());
        node.shutdown();
        let result = node.log_event(
            &EventSchema::new(0x0A01, 1, Importance::Production),
            &LogOptions::new(),
            |w| w.write_all(b"late"),
        );
        assert!(matches!(result, Err(ClientError::Log(_))));
    }
}
