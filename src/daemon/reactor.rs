//! Event-demultiplexing reactor: registered handlers are dispatched when
//! their poll items signal pending events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::utils::AcsError;

use async_trait::async_trait;
use futures::future;
use tokio::sync::Notify;
use tokio::time::{self, Duration};

/// Cheap cloneable readiness handle shared between an event source and the
/// reactor. The producing side rings it once per queued event; the handler
/// takes one ring per event it consumes.
#[derive(Debug, Clone)]
pub(crate) struct PollItem {
    /// Number of queued events not yet consumed.
    depth: Arc<AtomicUsize>,

    /// Rung on every `add_event()` to wake a parked `wait_events()`.
    bell: Arc<Notify>,
}

impl PollItem {
    pub(crate) fn new() -> Self {
        PollItem {
            depth: Arc::new(AtomicUsize::new(0)),
            bell: Arc::new(Notify::new()),
        }
    }

    /// Records one newly queued event and wakes any parked waiter.
    pub(crate) fn add_event(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.bell.notify_one();
    }

    /// Records consumption of one queued event.
    pub(crate) fn take_event(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether at least one queued event awaits consumption.
    pub(crate) fn has_events(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Waits until at least one queued event awaits consumption. A stale
    /// bell ring only causes a benign re-check of the depth.
    pub(crate) async fn wait_events(&self) {
        loop {
            if self.has_events() {
                return;
            }
            self.bell.notified().await;
        }
    }
}

/// Interface of a reactor-registered event handler. `Ctx` is the mutable
/// context threaded through dispatch (the daemon passes its pending-request
/// registry).
#[async_trait]
pub(crate) trait EventHandler<Ctx: Send>: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Readiness handle of the event source this handler consumes from.
    fn poll_item(&self) -> PollItem;

    /// Consumes one pending event. Returns `Ok(true)` to ask the reactor to
    /// unregister (and drop) this handler.
    async fn handle_event(&mut self, ctx: &mut Ctx)
        -> Result<bool, AcsError>;
}

/// Owns registered (poll item, handler) pairs and dispatches ready ones.
/// Handler errors are logged and never escape the event loop.
pub(crate) struct Reactor<Ctx> {
    handlers: Vec<(PollItem, Box<dyn EventHandler<Ctx>>)>,
}

impl<Ctx: Send> Reactor<Ctx> {
    pub(crate) fn new() -> Self {
        Reactor {
            handlers: Vec::new(),
        }
    }

    /// Takes ownership of a handler and appends it with its poll item.
    /// Registering the same event source twice is not detected; the second
    /// registration would compete for the same events.
    pub(crate) fn register_handler(
        &mut self,
        handler: Box<dyn EventHandler<Ctx>>,
    ) {
        let item = handler.poll_item();
        self.handlers.push((item, handler));
    }

    /// Number of currently registered handlers.
    pub(crate) fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    /// Waits at most `timeout` for any registered poll item to become
    /// ready, then dispatches every handler whose item has pending events.
    /// A ready item always has its paired handler stored alongside, so no
    /// unmatched-readiness case exists. A handler returning `Ok(true)` is
    /// unregistered and dropped.
    pub(crate) async fn handle_events(
        &mut self,
        ctx: &mut Ctx,
        timeout: Duration,
    ) -> Result<(), AcsError> {
        if self.handlers.is_empty() {
            // nothing registered; still honor the wait ceiling so the
            // caller's loop does not spin
            time::sleep(timeout).await;
            return Ok(());
        }

        let any_ready = {
            let waits: Vec<_> = self
                .handlers
                .iter()
                .map(|(item, _)| Box::pin(item.wait_events()))
                .collect();
            time::timeout(timeout, future::select_all(waits)).await.is_ok()
        };
        if !any_ready {
            return Ok(());
        }

        let mut idx = 0;
        while idx < self.handlers.len() {
            if !self.handlers[idx].0.has_events() {
                idx += 1;
                continue;
            }
            let name = self.handlers[idx].1.name();
            match self.handlers[idx].1.handle_event(ctx).await {
                Ok(true) => {
                    ad_debug!("unregistering handler '{}'", name);
                    self.handlers.remove(idx);
                    // no idx bump; the next pair shifted into this slot
                }
                Ok(false) => {
                    idx += 1;
                }
                Err(e) => {
                    ad_error!("error in handler '{}': {}", name, e);
                    idx += 1;
                }
            }
        }
        Ok(())
    }

    /// Unregisters and drops every handler.
    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }
}
