use crate::config::WILDCARD_CODE;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::utils::metrics::{global_metrics, Timer};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

/// Something that can react to an inbound message.
///
/// `C` is the context handed to each invocation; endpoints pass the
/// [`Peer`] the message arrived on, so a handler can answer it.
/// Implemented for any `Fn(Arc<Message>, C) -> impl Future<Output = Result<()>>`
/// closure.
///
/// [`Peer`]: crate::service::endpoint::Peer
pub trait Handler<C>: Send + Sync + 'static {
    fn call(&self, msg: Arc<Message>, ctx: C) -> BoxFuture<'static, Result<()>>;
}

impl<C, F, Fut> Handler<C> for F
where
    F: Fn(Arc<Message>, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, msg: Arc<Message>, ctx: C) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(msg, ctx))
    }
}

/// Identifies one registration, for [`Dispatcher::unregister`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handlers that were run
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

type HandlerList<C> = Vec<(HandlerId, Arc<dyn Handler<C>>)>;

/// Message dispatcher keyed by message code.
///
/// Every message goes to the handlers registered for its own code followed
/// by the handlers registered for [`WILDCARD_CODE`], in registration order.
pub struct Dispatcher<C> {
    handlers: RwLock<HashMap<String, HandlerList<C>>>,
    next_id: AtomicU64,
}

impl<C> Default for Dispatcher<C>
where
    C: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C>
where
    C: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an async closure handler for `code`. Registering the same
    /// handler twice makes it run twice.
    pub fn register<F, Fut>(&self, code: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Arc<Message>, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(code, handler)
    }

    /// Append any [`Handler`] implementation for `code`.
    pub fn register_handler<H>(&self, code: &str, handler: H) -> Result<HandlerId>
    where
        H: Handler<C>,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;

        handlers
            .entry(code.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(code, handler = id.0, "Handler registered");
        Ok(id)
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn unregister(&self, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;

        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        Ok(removed)
    }

    /// Number of handlers that would run for a message with this code
    pub fn handler_count(&self, code: &str) -> usize {
        self.resolve(code).map(|list| list.len()).unwrap_or(0)
    }

    /// Run every matching handler concurrently and wait for all of them.
    ///
    /// Handler failures and panics are logged and counted, never returned:
    /// one bad handler must not starve its siblings or the read loop.
    pub async fn dispatch(&self, msg: Arc<Message>, ctx: C) -> DispatchSummary {
        let handlers = match self.resolve(msg.code()) {
            Ok(handlers) => handlers,
            Err(e) => {
                error!(error = %e, code = msg.code(), "Dispatch skipped");
                return DispatchSummary::default();
            }
        };

        if handlers.is_empty() {
            debug!(id = msg.id(), code = msg.code(), "No handlers registered");
            return DispatchSummary::default();
        }

        let _timer = Timer::start("dispatch");
        let invocations = handlers.iter().map(|(id, handler)| {
            let call = handler.call(Arc::clone(&msg), ctx.clone());
            let id = *id;
            async move {
                let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::HandlerError(
                        constants::ERR_HANDLER_PANICKED.into(),
                    )),
                };
                (id, outcome)
            }
        });

        let mut summary = DispatchSummary {
            invoked: handlers.len(),
            failed: 0,
        };
        for (id, outcome) in join_all(invocations).await {
            if let Err(e) = outcome {
                summary.failed += 1;
                global_metrics().handler_error();
                error!(
                    error = %e,
                    handler = id.0,
                    id = msg.id(),
                    code = msg.code(),
                    "Handler failed"
                );
            }
        }
        global_metrics().handlers_invoked(summary.invoked as u64);
        summary
    }

    /// Snapshot the handlers for `code` plus the wildcard handlers.
    ///
    /// The lock is released before any handler runs, so registrations made
    /// during a dispatch apply from the next message on.
    fn resolve(&self, code: &str) -> Result<HandlerList<C>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.into()))?;

        let mut matched = Vec::new();
        if let Some(list) = handlers.get(code) {
            matched.extend(list.iter().cloned());
        }
        if code != WILDCARD_CODE {
            if let Some(list) = handlers.get(WILDCARD_CODE) {
                matched.extend(list.iter().cloned());
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(hits: &Arc<AtomicUsize>) -> impl Handler<()> {
        let hits = Arc::clone(hits);
        move |_msg: Arc<Message>, _: ()| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ProtocolError>(())
            }
        }
    }

    #[tokio::test]
    async fn test_code_and_wildcard_handlers_each_run_once() {
        let dispatcher = Dispatcher::<()>::new();
        let ping_a = counter();
        let ping_b = counter();
        let all = counter();
        dispatcher.register_handler("PING", counting(&ping_a)).unwrap();
        dispatcher.register_handler("PING", counting(&ping_b)).unwrap();
        dispatcher.register_handler(WILDCARD_CODE, counting(&all)).unwrap();

        let summary = dispatcher
            .dispatch(Arc::new(Message::empty("PING")), ())
            .await;

        assert_eq!(summary, DispatchSummary { invoked: 3, failed: 0 });
        assert_eq!(ping_a.load(Ordering::SeqCst), 1);
        assert_eq!(ping_b.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_message_does_not_run_handlers_twice() {
        let dispatcher = Dispatcher::<()>::new();
        let all = counter();
        dispatcher.register_handler(WILDCARD_CODE, counting(&all)).unwrap();

        dispatcher
            .dispatch(Arc::new(Message::empty(WILDCARD_CODE)), ())
            .await;
        assert_eq!(all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_runs_twice() {
        let dispatcher = Dispatcher::<()>::new();
        let hits = counter();
        dispatcher.register_handler("X", counting(&hits)).unwrap();
        dispatcher.register_handler("X", counting(&hits)).unwrap();

        dispatcher.dispatch(Arc::new(Message::empty("X")), ()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_codes_are_case_sensitive() {
        let dispatcher = Dispatcher::<()>::new();
        let hits = counter();
        dispatcher.register_handler("ping", counting(&hits)).unwrap();

        let summary = dispatcher.dispatch(Arc::new(Message::empty("PING")), ()).await;
        assert_eq!(summary.invoked, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_stop_siblings() {
        let dispatcher = Dispatcher::<()>::new();
        let hits = counter();
        dispatcher
            .register("X", |_m: Arc<Message>, _: ()| async {
                Err(ProtocolError::HandlerError("boom".into()))
            })
            .unwrap();
        dispatcher
            .register("X", |m: Arc<Message>, _: ()| async move {
                if m.code() == "X" {
                    panic!("handler bug");
                }
                Ok(())
            })
            .unwrap();
        dispatcher.register_handler("X", counting(&hits)).unwrap();

        let summary = dispatcher.dispatch(Arc::new(Message::empty("X")), ()).await;
        assert_eq!(summary, DispatchSummary { invoked: 3, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handlers_receive_context_and_message() {
        let dispatcher = Dispatcher::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher
            .register("HELLO", move |msg: Arc<Message>, ctx: String| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(format!("{ctx}:{}", msg.id()));
                    Ok(())
                }
            })
            .unwrap();

        let msg = Message::with_id(5, "HELLO", Default::default());
        dispatcher.dispatch(Arc::new(msg), "peer-1".to_string()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["peer-1:5".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_removes_only_that_handler() {
        let dispatcher = Dispatcher::<()>::new();
        let kept = counter();
        let dropped = counter();
        dispatcher.register_handler("X", counting(&kept)).unwrap();
        let id = dispatcher.register_handler("X", counting(&dropped)).unwrap();

        assert!(dispatcher.unregister(id).unwrap());
        assert!(!dispatcher.unregister(id).unwrap());
        assert_eq!(dispatcher.handler_count("X"), 1);

        dispatcher.dispatch(Arc::new(Message::empty("X")), ()).await;
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registration_during_dispatch_is_safe() {
        let dispatcher = Arc::new(Dispatcher::<()>::new());
        let hits = counter();
        let inner = Arc::clone(&dispatcher);
        let inner_hits = Arc::clone(&hits);
        dispatcher
            .register("GROW", move |_m: Arc<Message>, _: ()| {
                let inner = Arc::clone(&inner);
                let inner_hits = Arc::clone(&inner_hits);
                async move {
                    inner
                        .register_handler("GROW", counting(&inner_hits))
                        .map(|_| ())
                }
            })
            .unwrap();

        // The handler added mid-dispatch only sees the following message.
        let first = dispatcher.dispatch(Arc::new(Message::empty("GROW")), ()).await;
        assert_eq!(first.invoked, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let second = dispatcher.dispatch(Arc::new(Message::empty("GROW")), ()).await;
        assert_eq!(second.invoked, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
