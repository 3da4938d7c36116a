//! Subscription engine.
//!
//! Owns the pool of [`SubscriptionHandler`]s, routes inbound envelopes to
//! them, executes the actions they return and dispatches their application
//! callbacks.
//!
//! # Reentrancy
//!
//! Callbacks are queued, never invoked from inside a handler operation. The
//! queue is drained with the delegate taken out of the engine, and the
//! delegate gets `&mut SubscriptionEngine` so it can accept, reject or end
//! subscriptions from within a callback. Callbacks raised by such reentrant
//! calls are appended to the queue and delivered by the outer drain loop, in
//! order. No `RefCell` borrow of the shared log, timers or exchanges is held
//! while a callback runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use wdm_core::{
    EventLog, ExchangeAllocator, HandlerAction, HandlerContext, HandlerError, HandlerEvent,
    HandlerState, SubscriptionHandle, SubscriptionHandler, TimerId, TimerService, Timers,
    TraitDataSource,
};
use wdm_types::{
    status, CancelRequest, Envelope, ExchangeId, Message, NodeId, StatusReport, SubscribeRequest,
};

use crate::config::Config;
use crate::error::ClientError;

/// Application side of the subscription engine.
pub trait SubscriptionDelegate {
    /// A handler reported `event`.
    fn on_event(
        &mut self,
        engine: &mut SubscriptionEngine,
        handle: SubscriptionHandle,
        event: HandlerEvent,
    );
}

/// Delegate that accepts every request whose paths are all known and
/// version-compatible, and rejects the rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl SubscriptionDelegate for AutoAccept {
    fn on_event(
        &mut self,
        engine: &mut SubscriptionEngine,
        handle: SubscriptionHandle,
        event: HandlerEvent,
    ) {
        let HandlerEvent::SubscribeRequestParsed(parsed) = event else {
            return;
        };
        let result = if parsed.is_acceptable() {
            engine.accept(handle)
        } else {
            let code = if parsed.unknown_paths.is_empty() {
                status::WDM_UNSUPPORTED_VERSION
            } else {
                status::WDM_INVALID_PATH
            };
            engine.reject(handle, StatusReport::new(status::PROFILE_WDM, code))
        };
        if let Err(e) = result {
            warn!(%handle, error = %e, "auto-accept failed");
        }
    }
}

/// Engine limits.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Local node id, the source of every outbound envelope
    pub node_id: NodeId,
    /// Size of the handler pool
    pub max_subscriptions: usize,
    /// Byte budget of one Notify
    pub max_notify_bytes: usize,
    /// How long a subscriber has to acknowledge a Notify
    pub response_timeout: Duration,
}

impl EngineSettings {
    /// Settings from the `[node]` and `[subscriptions]` sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: NodeId::new(config.node.node_id),
            max_subscriptions: config.subscriptions.max_subscriptions,
            max_notify_bytes: config.subscriptions.max_notify_bytes,
            response_timeout: config.notify_timeout(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    handler: Option<SubscriptionHandler>,
}

/// Pool of subscription handlers plus their outbound queue.
pub struct SubscriptionEngine {
    settings: EngineSettings,
    log: Rc<RefCell<EventLog>>,
    timers: Rc<RefCell<Timers>>,
    exchanges: Rc<RefCell<ExchangeAllocator>>,
    data: Rc<dyn TraitDataSource>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    outbox: VecDeque<Envelope>,
    pending: VecDeque<(SubscriptionHandle, HandlerEvent)>,
    delegate: Option<Box<dyn SubscriptionDelegate>>,
    dispatching: bool,
    draining: bool,
}

impl SubscriptionEngine {
    /// Create an engine with an empty pool and no delegate.
    pub fn new(
        settings: EngineSettings,
        log: Rc<RefCell<EventLog>>,
        timers: Rc<RefCell<Timers>>,
        exchanges: Rc<RefCell<ExchangeAllocator>>,
        data: Rc<dyn TraitDataSource>,
    ) -> Self {
        Self {
            settings,
            log,
            timers,
            exchanges,
            data,
            slots: Vec::new(),
            free: Vec::new(),
            outbox: VecDeque::new(),
            pending: VecDeque::new(),
            delegate: None,
            dispatching: false,
            draining: false,
        }
    }

    /// Install the application delegate. Without one, callbacks are dropped.
    pub fn set_delegate(&mut self, delegate: impl SubscriptionDelegate + 'static) {
        self.delegate = Some(Box::new(delegate));
    }

    /// Route an inbound envelope to the handler it belongs to.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Envelope {
            exchange_id,
            source,
            message,
            ..
        } = envelope;
        match message {
            Message::SubscribeRequest(request) => {
                self.on_subscribe_request(source, exchange_id, request)
            }
            Message::StatusReport(report) => self.on_status_report(source, exchange_id, report),
            Message::CancelRequest(cancel) => self.on_cancel_request(source, exchange_id, cancel),
            other => {
                debug!(kind = other.kind(), peer = %source, "ignoring message");
                Ok(())
            }
        }
    }

    /// Accept a parsed subscribe request.
    pub fn accept(&mut self, handle: SubscriptionHandle) -> Result<(), ClientError> {
        self.run(handle, |h, ctx| h.accept(ctx))
    }

    /// Reject a parsed subscribe request.
    pub fn reject(
        &mut self,
        handle: SubscriptionHandle,
        reason: StatusReport,
    ) -> Result<(), ClientError> {
        self.run(handle, move |h, _| h.reject(reason))
    }

    /// End a subscription, telling the peer on a best-effort basis.
    pub fn end_subscription(
        &mut self,
        handle: SubscriptionHandle,
        reason: StatusReport,
    ) -> Result<(), ClientError> {
        self.run(handle, move |h, ctx| h.end_subscription(ctx.exchanges, reason))
    }

    /// Drop a subscription without telling anyone.
    pub fn abort(&mut self, handle: SubscriptionHandle) -> Result<(), ClientError> {
        self.run(handle, |h, ctx| Ok(h.abort(ctx.exchanges)))
    }

    /// Abort every subscription.
    pub fn abort_all(&mut self) {
        for handle in self.handles() {
            if let Err(e) = self.abort(handle) {
                warn!(%handle, error = %e, "abort failed");
            }
        }
    }

    /// Offer dirty trait data to every idle subscription. Logged events wait
    /// for [`flush`](Self::flush).
    pub fn notify_all(&mut self) {
        for handle in self.handles() {
            self.poke(handle);
        }
    }

    /// Offer dirty data and logged events to every idle subscription.
    pub fn flush(&mut self) {
        self.draining = true;
        for handle in self.handles() {
            self.poke(handle);
        }
        self.draining = false;
    }

    /// True while some idle subscription has not yet been sent every logged
    /// event it asked for.
    pub fn has_pending_events(&self) -> bool {
        let log = self.log.borrow();
        self.slots
            .iter()
            .filter_map(|slot| slot.handler.as_ref())
            .any(|h| h.has_pending_events(&log))
    }

    fn poke(&mut self, handle: SubscriptionHandle) {
        if let Err(e) = self.run(handle, |h, ctx| h.poke(ctx)) {
            let reason = e.to_string();
            warn!(%handle, error = %reason, "notify failed");
            if let Err(e) = self.run(handle, move |h, ctx| Ok(h.fail(ctx.exchanges, reason))) {
                warn!(%handle, error = %e, "terminating subscription failed");
            }
        }
    }

    /// A subscription timer fired. Timers of recycled slots are ignored.
    pub fn on_timer(&mut self, timer: TimerId) -> Result<(), ClientError> {
        let (handle, liveness) = match timer {
            TimerId::Liveness(handle) => (handle, true),
            TimerId::ResponseTimeout(handle) => (handle, false),
            TimerId::Flush | TimerId::Holdoff | TimerId::TransferTimeout => return Ok(()),
        };
        if self.index_of(handle).is_none() {
            trace!(%handle, ?timer, "dropping stale timer");
            return Ok(());
        }
        self.run(handle, move |h, ctx| {
            Ok(if liveness {
                h.on_liveness_timeout(ctx.exchanges)
            } else {
                h.on_response_timeout(ctx.exchanges)
            })
        })
    }

    /// Take every queued outbound envelope.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    /// Check if envelopes are waiting to be sent.
    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// State of a live handler.
    pub fn state(&self, handle: SubscriptionHandle) -> Option<HandlerState> {
        self.handler(handle).map(|h| h.state())
    }

    /// A live handler.
    pub fn handler(&self, handle: SubscriptionHandle) -> Option<&SubscriptionHandler> {
        self.index_of(handle)
            .and_then(|index| self.slots[index].handler.as_ref())
    }

    /// Number of handlers in use.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.handler.is_some()).count()
    }

    fn on_subscribe_request(
        &mut self,
        peer: NodeId,
        exchange: ExchangeId,
        request: SubscribeRequest,
    ) -> Result<(), ClientError> {
        let Some(handle) = self.claim() else {
            warn!(
                %peer,
                max = self.settings.max_subscriptions,
                "subscription pool exhausted"
            );
            self.reply(
                peer,
                exchange,
                StatusReport::new(status::PROFILE_WDM, status::WDM_OUT_OF_RESOURCES),
            );
            return Err(ClientError::NoMemory("subscription pool"));
        };
        debug!(%handle, %peer, "subscribe request");
        self.run(handle, move |h, ctx| {
            h.on_subscribe_request(ctx, peer, exchange, request)
        })
    }

    fn on_status_report(
        &mut self,
        peer: NodeId,
        exchange: ExchangeId,
        report: StatusReport,
    ) -> Result<(), ClientError> {
        let found = self.find(|h| h.peer() == peer && h.notify_exchange() == Some(exchange));
        let Some(handle) = found else {
            trace!(%peer, %exchange, "status report for no outstanding notify");
            return Ok(());
        };
        self.run(handle, move |h, ctx| h.on_status_report(ctx, exchange, report))
    }

    fn on_cancel_request(
        &mut self,
        peer: NodeId,
        exchange: ExchangeId,
        cancel: CancelRequest,
    ) -> Result<(), ClientError> {
        let found = self.find(|h| {
            h.peer() == peer
                && h.subscription_id() == Some(cancel.subscription_id)
                && h.state().is_active()
        });
        let Some(handle) = found else {
            debug!(%peer, subscription_id = %cancel.subscription_id, "cancel for unknown subscription");
            self.reply(
                peer,
                exchange,
                StatusReport::new(status::PROFILE_WDM, status::WDM_INVALID_SUBSCRIPTION),
            );
            return Ok(());
        };
        self.run(handle, move |h, ctx| Ok(h.on_cancel_request(ctx.exchanges, exchange)))
    }

    /// Run a handler operation, execute its actions, reclaim the slot if the
    /// handler is done, then deliver queued callbacks.
    fn run<F>(&mut self, handle: SubscriptionHandle, op: F) -> Result<(), ClientError>
    where
        F: FnOnce(
            &mut SubscriptionHandler,
            &mut HandlerContext<'_>,
        ) -> Result<Vec<HandlerAction>, HandlerError>,
    {
        let index = self
            .index_of(handle)
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown subscription {handle}")))?;

        let (peer, result) = {
            let log = self.log.borrow();
            let mut exchanges = self.exchanges.borrow_mut();
            let mut ctx = HandlerContext {
                log: &*log,
                data: self.data.as_ref(),
                exchanges: &mut *exchanges,
                max_notify_bytes: self.settings.max_notify_bytes,
                response_timeout: self.settings.response_timeout,
                take_events: self.draining,
            };
            let Some(handler) = self.slots[index].handler.as_mut() else {
                return Err(ClientError::InvalidArgument(format!(
                    "unknown subscription {handle}"
                )));
            };
            let result = op(handler, &mut ctx);
            (handler.peer(), result)
        };

        let outcome = result.map(|actions| self.apply(handle, peer, actions));
        self.reclaim(handle);
        self.dispatch();
        outcome.map_err(ClientError::from)
    }

    fn apply(&mut self, handle: SubscriptionHandle, peer: NodeId, actions: Vec<HandlerAction>) {
        for action in actions {
            match action {
                HandlerAction::Send { exchange, message } => {
                    trace!(%handle, %exchange, kind = message.kind(), "queue outbound");
                    self.outbox.push_back(Envelope::new(
                        exchange,
                        self.settings.node_id,
                        peer,
                        message,
                    ));
                }
                HandlerAction::ArmTimer(timer, after) => self.timers.borrow_mut().arm(timer, after),
                HandlerAction::CancelTimer(timer) => self.timers.borrow_mut().cancel(timer),
                HandlerAction::Callback(event) => self.pending.push_back((handle, event)),
            }
        }
    }

    fn dispatch(&mut self) {
        if self.dispatching {
            return;
        }
        let Some(mut delegate) = self.delegate.take() else {
            if !self.pending.is_empty() {
                debug!(dropped = self.pending.len(), "no delegate, dropping callbacks");
                self.pending.clear();
            }
            return;
        };

        self.dispatching = true;
        while let Some((handle, event)) = self.pending.pop_front() {
            delegate.on_event(self, handle, event);
        }
        self.dispatching = false;

        // The delegate may have installed a replacement.
        if self.delegate.is_none() {
            self.delegate = Some(delegate);
        }
    }

    fn reply(&mut self, peer: NodeId, exchange: ExchangeId, report: StatusReport) {
        self.outbox.push_back(Envelope::new(
            exchange,
            self.settings.node_id,
            peer,
            Message::StatusReport(report),
        ));
    }

    fn claim(&mut self) -> Option<SubscriptionHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.settings.max_subscriptions => {
                self.slots.push(Slot {
                    generation: 0,
                    handler: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let handle = SubscriptionHandle::new(index as u32, slot.generation);
        slot.handler = Some(SubscriptionHandler::new(handle));
        Some(handle)
    }

    fn reclaim(&mut self, handle: SubscriptionHandle) {
        let Some(index) = self.index_of(handle) else {
            return;
        };
        let slot = &mut self.slots[index];
        if slot
            .handler
            .as_ref()
            .is_some_and(|h| h.state().is_reclaimable())
        {
            slot.handler = None;
            self.free.push(index);
            info!(%handle, "subscription released");
        }
    }

    fn index_of(&self, handle: SubscriptionHandle) -> Option<usize> {
        let slot = self.slots.get(handle.index())?;
        (slot.generation == handle.generation() && slot.handler.is_some()).then(|| handle.index())
    }

    fn find(&self, mut matches: impl FnMut(&SubscriptionHandler) -> bool) -> Option<SubscriptionHandle> {
        self.slots
            .iter()
            .filter_map(|slot| slot.handler.as_ref())
            .find(|h| matches(*h))
            .map(|h| h.handle())
    }

    fn handles(&self) -> Vec<SubscriptionHandle> {
        self.slots
            .iter()
            .filter_map(|slot| slot.handler.as_ref().map(|h| h.handle()))
            .collect()
    }
}
