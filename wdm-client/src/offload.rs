//! Bulk offload client.
//!
//! Drives the pure BDX sender ([`TransferState`]) and the checkpointed
//! [`OffloadSession`] against the shared event log. Inbound envelopes go in
//! through [`BulkOffloadClient::handle_envelope`], outbound ones are queued
//! for the owner to send. [`BulkOffloadClient::run_upload`] does the whole
//! exchange over a [`Transport`].
//!
//! ```text
//! device                         collector
//!   │ ── SendInit ─────────────────▶ │
//!   │ ◀──────────────── SendAccept ─ │
//!   │ ◀──────────────── BlockQuery ─ │   ┐
//!   │ ── Block ────────────────────▶ │   ┘ repeated
//!   │ ── BlockEof ─────────────────▶ │
//!   │ ◀─────────────── BlockEofAck ─ │   commit
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use wdm_core::{
    EventLog, ExchangeAllocator, FailureReason, OffloadSession, OffloadState, TimerId,
    TimerService, Timers, TransferAction, TransferEvent, TransferState,
};
use wdm_types::{Envelope, ExchangeId, Message, NodeId, StatusReport};

use crate::config::Config;
use crate::error::ClientError;
use crate::transport::Transport;

/// How an upload attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadOutcome {
    /// The collector acknowledged every block; progress is committed.
    Done,
    /// The collector refused the transfer.
    Rejected {
        /// Reason given by the collector
        status: StatusReport,
    },
    /// The transfer failed; progress is rolled back.
    Failed {
        /// What went wrong
        reason: FailureReason,
        /// Status reported by the collector, if any
        status: Option<StatusReport>,
    },
    /// Aborted locally; progress is rolled back.
    Aborted,
}

impl OffloadOutcome {
    /// Check if the attempt committed its progress.
    pub fn is_done(&self) -> bool {
        matches!(self, OffloadOutcome::Done)
    }
}

/// Offload limits.
#[derive(Debug, Clone)]
pub struct OffloadSettings {
    /// Local node id
    pub node_id: NodeId,
    /// Largest block offered to the collector
    pub max_block_size: u32,
    /// Name of the uploaded file on the collector
    pub file_designator: String,
    /// How long the collector has to answer
    pub response_timeout: Duration,
}

impl OffloadSettings {
    /// Settings from the `[node]` and `[offload]` sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: NodeId::new(config.node.node_id),
            max_block_size: config.offload.max_block_size,
            file_designator: config.offload.file_designator.clone(),
            response_timeout: config.offload_timeout(),
        }
    }
}

impl Default for OffloadSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Uploads the event log to a collector, resuming where the last
/// acknowledged upload ended.
pub struct BulkOffloadClient {
    settings: OffloadSettings,
    log: Rc<RefCell<EventLog>>,
    timers: Rc<RefCell<Timers>>,
    exchanges: Rc<RefCell<ExchangeAllocator>>,
    session: OffloadSession,
    transfer: TransferState,
    exchange: Option<ExchangeId>,
    destination: NodeId,
    outbox: VecDeque<Envelope>,
}

impl BulkOffloadClient {
    /// Create an uninitialized client.
    pub fn new(
        settings: OffloadSettings,
        log: Rc<RefCell<EventLog>>,
        timers: Rc<RefCell<Timers>>,
        exchanges: Rc<RefCell<ExchangeAllocator>>,
    ) -> Self {
        Self {
            settings,
            log,
            timers,
            exchanges,
            session: OffloadSession::new(),
            transfer: TransferState::new(),
            exchange: None,
            destination: NodeId::default(),
            outbox: VecDeque::new(),
        }
    }

    /// Bind the client; starts a new retry session.
    pub fn init(&mut self) -> Result<(), ClientError> {
        self.session.init()?;
        Ok(())
    }

    /// Start an upload attempt to `destination` by sending SendInit.
    pub fn start_upload(&mut self, destination: NodeId) -> Result<(), ClientError> {
        if self.transfer.is_active() {
            return Err(ClientError::IncorrectState(format!(
                "transfer already running: {:?}",
                self.transfer
            )));
        }
        self.session.start(&mut self.log.borrow_mut())?;
        self.destination = destination;
        self.exchange = Some(self.exchanges.borrow_mut().open());
        info!(
            %destination,
            attempt = self.session.attempts(),
            file = %self.settings.file_designator,
            "upload started"
        );
        let outcome = self.step(TransferEvent::Start {
            file_designator: self.settings.file_designator.clone(),
            max_block_size: self.settings.max_block_size,
        });
        debug_assert!(outcome.is_none());
        Ok(())
    }

    /// Feed an inbound BDX envelope. Returns the outcome if the attempt ended.
    ///
    /// Envelopes for any exchange other than the running transfer's are
    /// ignored.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Option<OffloadOutcome> {
        if self.exchange != Some(envelope.exchange_id) {
            debug!(
                exchange = %envelope.exchange_id,
                kind = envelope.message.kind(),
                "ignoring stale transfer message"
            );
            return None;
        }
        let event = match envelope.message {
            Message::SendAccept(accept) => TransferEvent::Accepted {
                max_block_size: accept.max_block_size,
            },
            Message::SendReject(reject) => TransferEvent::Rejected {
                status: reject.status,
            },
            Message::BlockQuery(query) => TransferEvent::BlockQueried {
                block_counter: query.block_counter,
            },
            Message::BlockEofAck(ack) => TransferEvent::EofAcked {
                block_counter: ack.block_counter,
            },
            Message::TransferError(err) => TransferEvent::PeerError { status: err.status },
            other => {
                debug!(kind = other.kind(), "unexpected message on transfer exchange");
                return None;
            }
        };
        self.step(event)
    }

    /// The transport under the running transfer failed.
    pub fn on_transport_failure(&mut self, reason: impl Into<String>) -> Option<OffloadOutcome> {
        self.step(TransferEvent::TransportFailed {
            reason: reason.into(),
        })
    }

    /// The collector did not answer in time. Driven by the
    /// [`TimerId::TransferTimeout`] timer, armed on every send.
    pub fn on_timeout(&mut self) -> Option<OffloadOutcome> {
        self.step(TransferEvent::TimedOut)
    }

    /// Abort the running transfer, telling the collector.
    pub fn abort(&mut self) -> Option<OffloadOutcome> {
        self.step(TransferEvent::Abort)
    }

    /// Abort any running transfer and unbind.
    pub fn shutdown(&mut self) {
        if self.transfer.is_active() {
            self.abort();
        }
        self.session
            .shutdown(&mut self.log.borrow_mut(), &mut *self.timers.borrow_mut());
        info!("offload client shut down");
    }

    /// Take every queued outbound envelope.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    /// Lifecycle state of the session.
    pub fn state(&self) -> OffloadState {
        self.session.state()
    }

    /// Checkpoint session.
    pub fn session(&self) -> &OffloadSession {
        &self.session
    }

    /// Check if a transfer is running.
    pub fn is_transferring(&self) -> bool {
        self.transfer.is_active()
    }

    /// Exchange of the running transfer.
    pub fn exchange(&self) -> Option<ExchangeId> {
        self.exchange
    }

    /// Run one upload attempt to `destination` over `transport`.
    ///
    /// Connects if needed, then alternates sending queued envelopes and
    /// waiting for the collector, each wait bounded by the response timeout.
    pub async fn run_upload<T>(
        &mut self,
        transport: &T,
        destination: NodeId,
    ) -> Result<OffloadOutcome, ClientError>
    where
        T: Transport + ?Sized,
    {
        if !transport.is_connected() {
            transport.connect(destination).await?;
        }
        self.start_upload(destination)?;

        loop {
            if let Some(outcome) = self.flush(transport).await {
                return Ok(outcome);
            }

            let received =
                tokio::time::timeout(self.settings.response_timeout, transport.recv()).await;
            let outcome = match received {
                Ok(Ok(bytes)) => match Envelope::from_bytes(&bytes) {
                    Ok(envelope) => self.handle_envelope(envelope),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed envelope");
                        None
                    }
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "receive failed during upload");
                    self.on_transport_failure(e.to_string())
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.settings.response_timeout.as_millis() as u64,
                        "collector did not answer"
                    );
                    self.on_timeout()
                }
            };

            if let Some(outcome) = outcome {
                // Best effort: a TransferError may still be queued.
                self.flush(transport).await;
                return Ok(outcome);
            }
        }
    }

    async fn flush<T>(&mut self, transport: &T) -> Option<OffloadOutcome>
    where
        T: Transport + ?Sized,
    {
        for envelope in self.take_outbound() {
            let sent = match envelope.to_bytes() {
                Ok(bytes) => transport.send(&bytes).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = sent {
                warn!(kind = envelope.message.kind(), error = %reason, "send failed during upload");
                if let Some(outcome) = self.on_transport_failure(reason) {
                    self.outbox.clear();
                    return Some(outcome);
                }
            }
        }
        None
    }

    /// Run the transfer machine to quiescence.
    fn step(&mut self, event: TransferEvent) -> Option<OffloadOutcome> {
        let mut events = VecDeque::from([event]);
        let mut outcome = None;

        while let Some(event) = events.pop_front() {
            let (next, actions) = std::mem::take(&mut self.transfer).on_event(event);
            self.transfer = next;

            for action in actions {
                match action {
                    TransferAction::Send(message) => self.send(message),
                    TransferAction::FillBlock {
                        block_counter,
                        max_size,
                    } => {
                        let filled = self
                            .session
                            .fill_block(&mut self.log.borrow_mut(), max_size);
                        match filled {
                            Ok(block) => {
                                debug!(
                                    block_counter,
                                    events = block.events,
                                    bytes = block.data.len(),
                                    last = block.last,
                                    "block ready"
                                );
                                events.push_back(TransferEvent::BlockReady {
                                    data: block.data,
                                    last: block.last,
                                });
                            }
                            Err(e) => {
                                error!(block_counter, error = %e, "filling block failed");
                                events.push_back(TransferEvent::StorageFailed {
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                    TransferAction::Finished => {
                        self.session
                            .on_done(&mut self.log.borrow_mut(), &mut *self.timers.borrow_mut());
                        self.release_exchange();
                        info!(destination = %self.destination, "upload done");
                        outcome = Some(OffloadOutcome::Done);
                    }
                    TransferAction::Failed { reason, status } => {
                        self.session
                            .on_failure(&mut self.log.borrow_mut(), &mut *self.timers.borrow_mut());
                        self.release_exchange();
                        warn!(
                            destination = %self.destination,
                            %reason,
                            status = ?status,
                            attempt = self.session.attempts(),
                            "upload failed"
                        );
                        outcome = Some(match (reason, status) {
                            (FailureReason::Rejected, Some(status)) => {
                                OffloadOutcome::Rejected { status }
                            }
                            (FailureReason::Aborted, _) => OffloadOutcome::Aborted,
                            (reason, status) => OffloadOutcome::Failed { reason, status },
                        });
                    }
                }
            }
        }
        outcome
    }

    fn send(&mut self, message: Message) {
        let Some(exchange) = self.exchange else {
            warn!(kind = message.kind(), "no transfer exchange, dropping message");
            return;
        };
        self.outbox.push_back(Envelope::new(
            exchange,
            self.settings.node_id,
            self.destination,
            message,
        ));
        self.timers
            .borrow_mut()
            .arm(TimerId::TransferTimeout, self.settings.response_timeout);
    }

    fn release_exchange(&mut self) {
        self.timers.borrow_mut().cancel(TimerId::TransferTimeout);
        if let Some(exchange) = self.exchange.take() {
            self.exchanges.borrow_mut().close(exchange);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use wdm_core::{EventBatch, LogOptions, LogSettings, LoggingState, ManualClock, TierConfig};
    use wdm_types::{
        status, BlockEofAck, BlockQuery, EventSchema, Importance, SendAccept, SendReject,
        TransferError,
    };

    const DEVICE: NodeId = NodeId::new(0x10);
    const COLLECTOR: NodeId = NodeId::new(0xC0);

    fn new_log() -> Rc<RefCell<EventLog>> {
        Rc::new(RefCell::new(
            EventLog::new(
                vec![
                    TierConfig::volatile(Importance::Info, 4096),
                    TierConfig::volatile(Importance::Production, 4096),
                ],
                LogSettings::default(),
                Box::new(ManualClock::new(0)),
            )
            .unwrap(),
        ))
    }

    fn client(log: &Rc<RefCell<EventLog>>, max_block_size: u32) -> BulkOffloadClient {
        let settings = OffloadSettings {
            node_id: DEVICE,
            max_block_size,
            file_designator: "events".into(),
            response_timeout: Duration::from_millis(50),
        };
        let mut client = BulkOffloadClient::new(
            settings,
            log.clone(),
            Rc::new(RefCell::new(Timers::new())),
            Rc::new(RefCell::new(ExchangeAllocator::default())),
        );
        client.init().unwrap();
        client
    }

    fn emit(log: &Rc<RefCell<EventLog>>, importance: Importance, payload: &[u8]) {
        log.borrow_mut()
            .log_event(
                &EventSchema::new(0x0A01, 1, importance),
                &LogOptions::new(),
                |w| w.write_all(payload),
            )
            .unwrap();
    }

    fn reply(client: &mut BulkOffloadClient, message: Message) -> Option<OffloadOutcome> {
        let exchange = client.exchange().unwrap();
        client.handle_envelope(Envelope::new(exchange, COLLECTOR, DEVICE, message))
    }

    fn sent(client: &mut BulkOffloadClient) -> Vec<Message> {
        client
            .take_outbound()
            .into_iter()
            .map(|envelope| envelope.message)
            .collect()
    }

    #[test]
    fn full_upload_commits_progress() {
        let log = new_log();
        emit(&log, Importance::Info, b"a");
        emit(&log, Importance::Production, b"b");
        let mut client = client(&log, 1024);

        client.start_upload(COLLECTOR).unwrap();
        assert!(matches!(sent(&mut client).as_slice(), [Message::SendInit(_)]));

        assert!(reply(&mut client, Message::SendAccept(SendAccept { max_block_size: 0 })).is_none());
        assert!(reply(&mut client, Message::BlockQuery(BlockQuery { block_counter: 0 })).is_none());

        let eof = match sent(&mut client).remove(0) {
            Message::BlockEof(eof) => eof,
            other => panic!("expected BlockEof, got {other:?}"),
        };
        let records = EventBatch::decode(&eof.data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].importance, Importance::Info);
        assert_eq!(records[1].importance, Importance::Production);

        let outcome = reply(&mut client, Message::BlockEofAck(BlockEofAck { block_counter: 0 }));
        assert_eq!(outcome, Some(OffloadOutcome::Done));
        assert!(!client.is_transferring());
        assert_eq!(client.session().attempts(), 0);
        assert_eq!(log.borrow().state(), LoggingState::Holdoff);
    }

    #[test]
    fn small_blocks_span_several_queries() {
        let log = new_log();
        for _ in 0..4 {
            emit(&log, Importance::Info, &[7u8; 40]);
        }
        let mut client = client(&log, 100);
        client.start_upload(COLLECTOR).unwrap();
        reply(&mut client, Message::SendAccept(SendAccept { max_block_size: 0 }));

        let mut counter = 0;
        let mut records = Vec::new();
        loop {
            reply(&mut client, Message::BlockQuery(BlockQuery { block_counter: counter }));
            match sent(&mut client).remove(0) {
                Message::Block(block) => {
                    assert_eq!(block.block_counter, counter);
                    records.extend(EventBatch::decode(&block.data).unwrap());
                }
                Message::BlockEof(eof) => {
                    records.extend(EventBatch::decode(&eof.data).unwrap());
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
            counter += 1;
        }
        assert!(counter > 0);
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn rejection_rolls_back() {
        let log = new_log();
        emit(&log, Importance::Info, b"a");
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();

        let status = StatusReport::new(status::PROFILE_BDX, status::BDX_TRANSFER_REJECTED);
        let outcome = reply(&mut client, Message::SendReject(SendReject { status }));
        assert_eq!(outcome, Some(OffloadOutcome::Rejected { status }));
        assert_eq!(client.state(), OffloadState::Initialized);
        assert_eq!(client.session().attempts(), 1);
    }

    #[test]
    fn bad_block_counter_fails_transfer() {
        let log = new_log();
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();
        reply(&mut client, Message::SendAccept(SendAccept { max_block_size: 0 }));
        sent(&mut client);

        let outcome = reply(&mut client, Message::BlockQuery(BlockQuery { block_counter: 3 }));
        assert!(matches!(
            outcome,
            Some(OffloadOutcome::Failed {
                reason: FailureReason::BadBlockCounter,
                ..
            })
        ));
        assert!(matches!(sent(&mut client).as_slice(), [Message::TransferError(_)]));
    }

    #[test]
    fn stale_exchange_is_ignored() {
        let log = new_log();
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();
        let current = client.exchange().unwrap();

        let stale = Envelope::new(
            current.next(),
            COLLECTOR,
            DEVICE,
            Message::TransferError(TransferError {
                status: StatusReport::new(status::PROFILE_BDX, status::BDX_TRANSFER_FAILED),
            }),
        );
        assert!(client.handle_envelope(stale).is_none());
        assert!(client.is_transferring());
    }

    #[test]
    fn local_abort_tells_collector() {
        let log = new_log();
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();
        sent(&mut client);

        assert_eq!(client.abort(), Some(OffloadOutcome::Aborted));
        assert!(matches!(sent(&mut client).as_slice(), [Message::TransferError(_)]));
        assert!(client.abort().is_none());
    }

    #[test]
    fn second_start_while_running_fails() {
        let log = new_log();
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();
        assert!(matches!(
            client.start_upload(COLLECTOR),
            Err(ClientError::IncorrectState(_))
        ));
    }

    #[test]
    fn shutdown_aborts_and_unbinds() {
        let log = new_log();
        let mut client = client(&log, 1024);
        client.start_upload(COLLECTOR).unwrap();
        client.shutdown();

        assert_eq!(client.state(), OffloadState::Uninitialized);
        assert!(!client.is_transferring());
        assert!(matches!(
            client.start_upload(COLLECTOR),
            Err(ClientError::Offload(_))
        ));
    }

    /// Collector that accepts and acknowledges everything.
    fn collector(received: Arc<Mutex<Vec<Vec<u8>>>>) -> MockTransport {
        MockTransport::new().with_responder(move |envelope| {
            let answer = match &envelope.message {
                Message::SendInit(_) => vec![
                    Message::SendAccept(SendAccept { max_block_size: 0 }),
                    Message::BlockQuery(BlockQuery { block_counter: 0 }),
                ],
                Message::Block(block) => {
                    received.lock().unwrap().push(block.data.clone());
                    vec![Message::BlockQuery(BlockQuery {
                        block_counter: block.block_counter + 1,
                    })]
                }
                Message::BlockEof(eof) => {
                    received.lock().unwrap().push(eof.data.clone());
                    vec![Message::BlockEofAck(BlockEofAck {
                        block_counter: eof.block_counter,
                    })]
                }
                _ => Vec::new(),
            };
            answer.into_iter().map(|m| envelope.reply(m)).collect()
        })
    }

    #[tokio::test]
    async fn run_upload_over_transport() {
        let log = new_log();
        for i in 0..10u8 {
            emit(&log, Importance::Production, &[i; 30]);
        }
        let received = Arc::new(Mutex::new(Vec::new()));
        let transport = collector(received.clone());
        let mut client = client(&log, 128);

        let outcome = client.run_upload(&transport, COLLECTOR).await.unwrap();
        assert_eq!(outcome, OffloadOutcome::Done);
        assert_eq!(transport.connected_peer(), Some(COLLECTOR));

        let events: usize = received
            .lock()
            .unwrap()
            .iter()
            .map(|data| EventBatch::decode(data).unwrap().len())
            .sum();
        assert_eq!(events, 10);
    }

    #[tokio::test]
    async fn closed_connection_fails_attempt() {
        let log = new_log();
        emit(&log, Importance::Info, b"a");
        let transport = MockTransport::new();
        transport.connect(COLLECTOR).await.unwrap();
        let mut client = client(&log, 1024);

        // An empty mock queue reads as a closed connection.
        let outcome = client.run_upload(&transport, COLLECTOR).await.unwrap();
        assert!(matches!(
            outcome,
            OffloadOutcome::Failed {
                reason: FailureReason::TransportFailure(_),
                ..
            }
        ));
        assert_eq!(client.state(), OffloadState::Initialized);
        assert_eq!(
            client.session().scheduled().get(Importance::Info),
            client.session().transmitted().get(Importance::Info)
        );
    }
}
