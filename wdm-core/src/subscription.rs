//! Publisher-side subscription handler state machine.
//!
//! The handler is pure: every operation takes the shared state it needs
//! through a [`HandlerContext`] and returns the [`HandlerAction`]s the caller
//! must execute, in order. It never calls the application directly;
//! application callbacks are emitted as [`HandlerAction::Callback`] and are
//! always the last action of a termination, after every exchange handle has
//! been cleared, so a reentrant call from the callback sees a settled handler.
//!
//! ```text
//! Free ─request─▶ SubscribingEvaluating ─accept─▶ Subscribing ─▶ SubscribingNotifying
//!                                                                    │ ack
//!                      EstablishedIdle ◀── SubscribingResponding ◀───┘
//!                        ▲       │ dirty / new events
//!                        └─ack── EstablishedNotifying
//!
//! any active state ─end/abort/timeout/peer cancel─▶ Canceling/Aborting ─▶ Aborted
//! ```
//!
//! At most one Notify is outstanding at a time. Data that changes while a
//! Notify is in flight is picked up by the next one: interests remember the
//! data version the peer acknowledged, not a dirty flag.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use wdm_types::{
    status, CancelRequest, DataElement, ExchangeId, Message, NodeId, Notify, SchemaVersionRange,
    StatusReport, SubscribeRequest, SubscribeResponse, SubscriptionId, TraitInstance,
    TraitPathRequest, WdmError,
};

use crate::cursor::EventCursors;
use crate::exchange::ExchangeAllocator;
use crate::log::{EventBatch, EventLog, FetchOutcome, LogError};
use crate::timer::TimerId;

/// Arena handle of a subscription handler.
///
/// The generation changes every time a slot is reused, so timers and
/// responses aimed at a previous occupant are recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle {
    index: u32,
    generation: u32,
}

impl SubscriptionHandle {
    /// Create a handle.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the handler arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}.{}", self.index, self.generation)
    }
}

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerState {
    /// Unused; can be claimed.
    #[default]
    Free,
    /// Request parsed; waiting for the application to accept or reject.
    SubscribingEvaluating,
    /// Accepted; preparing the initial Notify.
    Subscribing,
    /// Initial Notify in flight.
    SubscribingNotifying,
    /// Sending the SubscribeResponse.
    SubscribingResponding,
    /// Established with nothing in flight.
    EstablishedIdle,
    /// Established with a Notify in flight.
    EstablishedNotifying,
    /// Locally ended; telling the peer.
    Canceling,
    /// Releasing resources.
    Aborting,
    /// Terminated; can be reclaimed.
    Aborted,
}

impl HandlerState {
    /// Check if the slot can be reused.
    pub fn is_reclaimable(self) -> bool {
        matches!(self, HandlerState::Free | HandlerState::Aborted)
    }

    /// Check if the subscription is established.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            HandlerState::EstablishedIdle | HandlerState::EstablishedNotifying
        )
    }

    /// Check if the handler is serving a subscription.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            HandlerState::SubscribingEvaluating
                | HandlerState::Subscribing
                | HandlerState::SubscribingNotifying
                | HandlerState::SubscribingResponding
                | HandlerState::EstablishedIdle
                | HandlerState::EstablishedNotifying
        )
    }
}

/// Read access to published trait data.
pub trait TraitDataSource {
    /// Schema versions the instance can be encoded at; `None` if unknown.
    fn supported_versions(&self, instance: &TraitInstance) -> Option<SchemaVersionRange>;

    /// Current data version of the instance.
    fn data_version(&self, instance: &TraitInstance) -> Option<u64>;

    /// Current data of the instance encoded at `schema_version`.
    fn snapshot(&self, instance: &TraitInstance, schema_version: u16) -> Option<DataElement>;
}

/// Shared state a handler operation works against.
pub struct HandlerContext<'a> {
    /// Event log notifications draw events from
    pub log: &'a EventLog,
    /// Published trait data
    pub data: &'a dyn TraitDataSource,
    /// Allocator for locally initiated exchanges
    pub exchanges: &'a mut ExchangeAllocator,
    /// Byte budget of one Notify
    pub max_notify_bytes: usize,
    /// How long the peer has to acknowledge a Notify
    pub response_timeout: Duration,
    /// Whether Notifies may take new events from the log. Initial Notifies
    /// always do.
    pub take_events: bool,
}

/// Instruction for the caller of a handler operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerAction {
    /// Send `message` to the handler's peer on `exchange`.
    Send {
        /// Exchange to send on
        exchange: ExchangeId,
        /// Message to send
        message: Message,
    },
    /// Arm a timer.
    ArmTimer(TimerId, Duration),
    /// Cancel a timer.
    CancelTimer(TimerId),
    /// Report to the application.
    Callback(HandlerEvent),
}

/// Application-facing handler events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    /// A subscribe request arrived; accept or reject it.
    SubscribeRequestParsed(ParsedRequest),
    /// The subscription is established.
    Established {
        /// Assigned subscription id
        subscription_id: SubscriptionId,
    },
    /// The subscription ended without the application asking for it.
    Terminated {
        /// Why it ended
        reason: TerminationReason,
    },
}

/// What a subscribe request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Requesting node
    pub peer: NodeId,
    /// Requested paths
    pub paths: Vec<TraitPathRequest>,
    /// Paths the data source does not know
    pub unknown_paths: Vec<TraitInstance>,
    /// Paths whose requested versions do not overlap the supported ones
    pub incompatible: Vec<TraitInstance>,
    /// Requested liveness timeout
    pub liveness_timeout: Option<Duration>,
}

impl ParsedRequest {
    /// Check if every path is known and version-compatible.
    pub fn is_acceptable(&self) -> bool {
        self.unknown_paths.is_empty() && self.incompatible.is_empty()
    }
}

/// Why a subscription terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Liveness or response timer expired.
    Timeout,
    /// The peer sent a CancelRequest.
    PeerCanceled,
    /// The peer answered a Notify with a failure status.
    PeerStatus(StatusReport),
    /// A local failure stopped the subscription.
    Internal(String),
}

impl TerminationReason {
    fn status(&self) -> StatusReport {
        match self {
            TerminationReason::Timeout => {
                StatusReport::new(status::PROFILE_WDM, status::WDM_SUBSCRIPTION_TIMEOUT)
            }
            TerminationReason::PeerCanceled | TerminationReason::PeerStatus(_) => {
                StatusReport::new(status::PROFILE_WDM, status::WDM_SUBSCRIPTION_CANCELED)
            }
            TerminationReason::Internal(_) => {
                StatusReport::new(status::PROFILE_COMMON, status::COMMON_INTERNAL_ERROR)
            }
        }
    }
}

/// Errors from handler operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Operation not allowed in the current state
    #[error("incorrect handler state: {0:?}")]
    IncorrectState(HandlerState),

    /// Reading the event log failed
    #[error("event log error: {0}")]
    Log(#[from] LogError),

    /// Decoding fetched events failed
    #[error("wire error: {0}")]
    Wire(#[from] WdmError),
}

#[derive(Debug, Clone)]
struct Interest {
    path: TraitPathRequest,
    /// Negotiated schema version; `None` for unknown or incompatible paths.
    schema_version: Option<u16>,
    acked_version: Option<u64>,
}

#[derive(Debug, Clone)]
struct InFlight {
    cursors: EventCursors,
    versions: Vec<Option<u64>>,
}

/// One subscription served to one peer.
#[derive(Debug, Clone)]
pub struct SubscriptionHandler {
    handle: SubscriptionHandle,
    state: HandlerState,
    subscription_id: Option<SubscriptionId>,
    peer: NodeId,
    interests: Vec<Interest>,
    acked: EventCursors,
    in_flight: Option<InFlight>,
    liveness: Option<Duration>,
    request_exchange: Option<ExchangeId>,
    notify_exchange: Option<ExchangeId>,
}

impl SubscriptionHandler {
    /// Create a free handler for slot `handle`.
    pub fn new(handle: SubscriptionHandle) -> Self {
        Self {
            handle,
            state: HandlerState::Free,
            subscription_id: None,
            peer: NodeId::default(),
            interests: Vec::new(),
            acked: EventCursors::new(),
            in_flight: None,
            liveness: None,
            request_exchange: None,
            notify_exchange: None,
        }
    }

    /// Arena handle.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Current state.
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Subscription id, once accepted.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id
    }

    /// Subscriber node.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Exchange of the outstanding Notify.
    pub fn notify_exchange(&self) -> Option<ExchangeId> {
        self.notify_exchange
    }

    /// Next event the peer has not acknowledged, per importance.
    pub fn cursors(&self) -> &EventCursors {
        &self.acked
    }

    /// Handle an inbound subscribe request.
    pub fn on_subscribe_request(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        peer: NodeId,
        exchange: ExchangeId,
        request: SubscribeRequest,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        self.expect(&[HandlerState::Free])?;

        let mut parsed = ParsedRequest {
            peer,
            paths: request.paths.clone(),
            unknown_paths: Vec::new(),
            incompatible: Vec::new(),
            liveness_timeout: request
                .liveness_timeout_secs
                .map(|secs| Duration::from_secs(secs.into())),
        };

        let mut interests = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            let schema_version = match ctx.data.supported_versions(&path.instance) {
                None => {
                    parsed.unknown_paths.push(path.instance);
                    None
                }
                Some(supported) => match supported.intersect(&path.versions) {
                    Some(common) => Some(common.max),
                    None => {
                        parsed.incompatible.push(path.instance);
                        None
                    }
                },
            };
            interests.push(Interest {
                path: *path,
                schema_version,
                acked_version: None,
            });
        }

        let mut acked = EventCursors::after_observed(&request.last_observed);
        for importance in ctx.log.tier_importances() {
            let observed = request
                .last_observed
                .iter()
                .any(|(imp, _)| *imp == importance);
            if !observed {
                acked.set(importance, ctx.log.first_event_id(importance)?);
            }
        }

        self.peer = peer;
        self.interests = interests;
        self.acked = acked;
        self.liveness = parsed.liveness_timeout;
        self.request_exchange = Some(exchange);
        self.state = HandlerState::SubscribingEvaluating;
        debug!(
            handle = %self.handle,
            peer = %peer,
            paths = parsed.paths.len(),
            acceptable = parsed.is_acceptable(),
            "subscribe request parsed"
        );

        Ok(vec![HandlerAction::Callback(
            HandlerEvent::SubscribeRequestParsed(parsed),
        )])
    }

    /// Accept the parsed request and send the initial Notify.
    pub fn accept(
        &mut self,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        self.expect(&[HandlerState::SubscribingEvaluating])?;

        let subscription_id = SubscriptionId::random();
        self.subscription_id = Some(subscription_id);
        self.state = HandlerState::Subscribing;

        let mut actions = Vec::new();
        if let Some(liveness) = self.liveness {
            actions.push(HandlerAction::ArmTimer(
                TimerId::Liveness(self.handle),
                liveness,
            ));
        }
        actions.extend(self.send_notify(ctx, true)?);
        self.state = HandlerState::SubscribingNotifying;
        info!(handle = %self.handle, %subscription_id, "subscription accepted");
        Ok(actions)
    }

    /// Reject the parsed request and free the handler.
    pub fn reject(&mut self, reason: StatusReport) -> Result<Vec<HandlerAction>, HandlerError> {
        self.expect(&[HandlerState::SubscribingEvaluating])?;

        let mut actions = Vec::new();
        if let Some(exchange) = self.request_exchange.take() {
            actions.push(HandlerAction::Send {
                exchange,
                message: Message::StatusReport(reason),
            });
        }
        info!(handle = %self.handle, %reason, "subscription rejected");
        *self = Self::new(self.handle);
        Ok(actions)
    }

    /// Handle a StatusReport answering a Notify.
    pub fn on_status_report(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        exchange: ExchangeId,
        report: StatusReport,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        if self.notify_exchange != Some(exchange) {
            debug!(handle = %self.handle, %exchange, "ignoring stale status report");
            return Ok(Vec::new());
        }
        self.notify_exchange = None;
        ctx.exchanges.close(exchange);

        let mut actions = vec![HandlerAction::CancelTimer(TimerId::ResponseTimeout(
            self.handle,
        ))];
        if !report.is_success() {
            warn!(handle = %self.handle, %report, "notify rejected by peer");
            actions.extend(self.terminate(ctx.exchanges, TerminationReason::PeerStatus(report)));
            return Ok(actions);
        }

        self.commit_in_flight();
        if let Some(liveness) = self.liveness {
            actions.push(HandlerAction::ArmTimer(
                TimerId::Liveness(self.handle),
                liveness,
            ));
        }

        match self.state {
            HandlerState::SubscribingNotifying => {
                self.state = HandlerState::SubscribingResponding;
                if let (Some(request), Some(subscription_id)) =
                    (self.request_exchange.take(), self.subscription_id)
                {
                    actions.push(HandlerAction::Send {
                        exchange: request,
                        message: Message::SubscribeResponse(SubscribeResponse {
                            subscription_id,
                            liveness_timeout_secs: self.liveness.map(|d| d.as_secs() as u32),
                        }),
                    });
                    self.state = HandlerState::EstablishedIdle;
                    info!(handle = %self.handle, %subscription_id, "subscription established");
                    actions.push(HandlerAction::Callback(HandlerEvent::Established {
                        subscription_id,
                    }));
                }
            }
            HandlerState::EstablishedNotifying => {
                self.state = HandlerState::EstablishedIdle;
            }
            _ => {}
        }

        actions.extend(self.poke(ctx)?);
        Ok(actions)
    }

    /// Send a Notify if the subscription is idle and has something to send.
    pub fn poke(
        &mut self,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        if self.state != HandlerState::EstablishedIdle {
            return Ok(Vec::new());
        }
        let actions = self.send_notify(ctx, false)?;
        if !actions.is_empty() {
            self.state = HandlerState::EstablishedNotifying;
        }
        Ok(actions)
    }

    /// Check if the log holds events this idle subscription has not taken.
    pub fn has_pending_events(&self, log: &EventLog) -> bool {
        self.state == HandlerState::EstablishedIdle
            && log
                .tier_importances()
                .into_iter()
                .any(|importance| log.has_events_after(importance, self.acked.get(importance)))
    }

    /// Handle a CancelRequest from the peer.
    pub fn on_cancel_request(
        &mut self,
        exchanges: &mut ExchangeAllocator,
        exchange: ExchangeId,
    ) -> Vec<HandlerAction> {
        let mut actions = vec![HandlerAction::Send {
            exchange,
            message: Message::StatusReport(StatusReport::success()),
        }];
        if self.state.is_active() {
            info!(handle = %self.handle, "subscription canceled by peer");
            actions.extend(self.terminate(exchanges, TerminationReason::PeerCanceled));
        }
        actions
    }

    /// End the subscription locally, telling the peer on a best-effort basis.
    ///
    /// No application callback follows.
    pub fn end_subscription(
        &mut self,
        exchanges: &mut ExchangeAllocator,
        reason: StatusReport,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        if !self.state.is_active() {
            return Err(HandlerError::IncorrectState(self.state));
        }
        self.state = HandlerState::Canceling;

        let mut actions = Vec::new();
        if let Some(request) = self.request_exchange.take() {
            actions.push(HandlerAction::Send {
                exchange: request,
                message: Message::StatusReport(reason),
            });
        } else if let Some(subscription_id) = self.subscription_id {
            // Nobody waits for the answer.
            let exchange = exchanges.open();
            actions.push(HandlerAction::Send {
                exchange,
                message: Message::CancelRequest(CancelRequest {
                    subscription_id,
                    reason,
                }),
            });
            exchanges.close(exchange);
        }
        info!(handle = %self.handle, %reason, "subscription ended");
        actions.extend(self.release(exchanges));
        Ok(actions)
    }

    /// Terminate immediately: no peer message, no callback.
    pub fn abort(&mut self, exchanges: &mut ExchangeAllocator) -> Vec<HandlerAction> {
        if self.state.is_reclaimable() {
            return Vec::new();
        }
        debug!(handle = %self.handle, state = ?self.state, "subscription aborted");
        self.request_exchange = None;
        self.release(exchanges)
    }

    /// The liveness timer expired.
    pub fn on_liveness_timeout(&mut self, exchanges: &mut ExchangeAllocator) -> Vec<HandlerAction> {
        if !self.state.is_active() {
            return Vec::new();
        }
        warn!(handle = %self.handle, "subscription liveness expired");
        self.terminate(exchanges, TerminationReason::Timeout)
    }

    /// The peer did not answer the outstanding Notify in time.
    pub fn on_response_timeout(&mut self, exchanges: &mut ExchangeAllocator) -> Vec<HandlerAction> {
        if self.notify_exchange.is_none() || !self.state.is_active() {
            return Vec::new();
        }
        warn!(handle = %self.handle, "notify response timed out");
        self.terminate(exchanges, TerminationReason::Timeout)
    }

    /// Terminate on a local failure, with a callback.
    pub fn fail(&mut self, exchanges: &mut ExchangeAllocator, reason: String) -> Vec<HandlerAction> {
        if !self.state.is_active() {
            return Vec::new();
        }
        self.terminate(exchanges, TerminationReason::Internal(reason))
    }

    fn expect(&self, allowed: &[HandlerState]) -> Result<(), HandlerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(HandlerError::IncorrectState(self.state))
        }
    }

    /// Release everything, then report. The callback is the last action.
    fn terminate(
        &mut self,
        exchanges: &mut ExchangeAllocator,
        reason: TerminationReason,
    ) -> Vec<HandlerAction> {
        let mut actions = Vec::new();
        if let Some(request) = self.request_exchange.take() {
            actions.push(HandlerAction::Send {
                exchange: request,
                message: Message::StatusReport(reason.status()),
            });
        }
        actions.extend(self.release(exchanges));
        actions.push(HandlerAction::Callback(HandlerEvent::Terminated { reason }));
        actions
    }

    fn release(&mut self, exchanges: &mut ExchangeAllocator) -> Vec<HandlerAction> {
        self.state = HandlerState::Aborting;
        if let Some(exchange) = self.notify_exchange.take() {
            exchanges.close(exchange);
        }
        self.request_exchange = None;
        self.in_flight = None;
        self.state = HandlerState::Aborted;
        vec![
            HandlerAction::CancelTimer(TimerId::Liveness(self.handle)),
            HandlerAction::CancelTimer(TimerId::ResponseTimeout(self.handle)),
        ]
    }

    fn commit_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        self.acked = in_flight.cursors;
        for (interest, version) in self.interests.iter_mut().zip(in_flight.versions) {
            interest.acked_version = version;
        }
    }

    /// Build and send a Notify. With `force`, every compatible interest is
    /// included; otherwise only changed ones, and nothing is sent when there
    /// is nothing new.
    fn send_notify(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        force: bool,
    ) -> Result<Vec<HandlerAction>, HandlerError> {
        if self.notify_exchange.is_some() {
            return Ok(Vec::new());
        }
        let Some(subscription_id) = self.subscription_id else {
            return Ok(Vec::new());
        };

        let mut data = Vec::new();
        let mut versions = Vec::with_capacity(self.interests.len());
        let mut data_bytes = 0;
        for interest in &self.interests {
            let mut sent = interest.acked_version;
            if let Some(schema_version) = interest.schema_version {
                let current = ctx.data.data_version(&interest.path.instance);
                if force || current != interest.acked_version {
                    if let Some(element) =
                        ctx.data.snapshot(&interest.path.instance, schema_version)
                    {
                        data_bytes += element.payload.len();
                        sent = Some(element.version);
                        data.push(element);
                    }
                }
            }
            versions.push(sent);
        }

        let mut batch = EventBatch::new(ctx.max_notify_bytes.saturating_sub(data_bytes));
        let mut cursors = self.acked;
        let importances = if force || ctx.take_events {
            ctx.log.tier_importances()
        } else {
            Vec::new()
        };
        'tiers: for importance in importances {
            loop {
                match ctx.log.fetch_events(&mut batch, importance, &mut cursors) {
                    Ok(FetchOutcome::Exhausted) => break,
                    Ok(FetchOutcome::DestinationFull) => break 'tiers,
                    Err(LogError::BufferTooSmall { capacity }) if data.is_empty() => {
                        let event = cursors.get(importance);
                        warn!(
                            handle = %self.handle,
                            %importance,
                            %event,
                            capacity,
                            "event larger than a notify, skipping"
                        );
                        cursors.set(importance, event.next());
                    }
                    Err(LogError::BufferTooSmall { .. }) => break 'tiers,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let events = batch.records()?;
        if !force && data.is_empty() && events.is_empty() {
            self.acked = cursors;
            return Ok(Vec::new());
        }

        let exchange = ctx.exchanges.open();
        self.notify_exchange = Some(exchange);
        self.in_flight = Some(InFlight { cursors, versions });
        debug!(
            handle = %self.handle,
            %exchange,
            data = data.len(),
            events = events.len(),
            "sending notify"
        );

        Ok(vec![
            HandlerAction::Send {
                exchange,
                message: Message::Notify(Notify {
                    subscription_id,
                    data,
                    events,
                }),
            },
            HandlerAction::ArmTimer(TimerId::ResponseTimeout(self.handle), ctx.response_timeout),
        ])
    }
}
