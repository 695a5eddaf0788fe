//! Serialized command queue
//!
//! One worker task per connection epoch issues transport operations strictly in
//! submission order and keeps at most one of them outstanding. Each operation
//! waits for its completion signal or its deadline, whichever comes first.
//!
//! ```text
//!   submit() ──▶ pending ──▶ worker ──▶ Transport call
//!                               │            │
//!                               │   TransportSink::operation_complete
//!                               │            │
//!                               ◀── oneshot ─┘   (or deadline / shutdown)
//! ```

use crate::domain::models::{AttributeHandle, GattStatus, OperationKind, PeerIdentity};
use crate::error::{OperationError, TransportError};
use crate::infrastructure::bluetooth::events::{ErrorEvent, ErrorSource};
use crate::infrastructure::bluetooth::observer::EventBus;
use crate::infrastructure::bluetooth::protocol::DISABLE_NOTIFICATION_VALUE;
use crate::infrastructure::bluetooth::registry::AttributeRef;
use crate::infrastructure::bluetooth::transport::{LinkHandle, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type OperationResult = Result<Vec<u8>, OperationError>;

/// Resolves to the outcome of one queued operation.
///
/// Dropping a receipt does not cancel the operation.
#[must_use = "the operation runs regardless; await the receipt to observe its outcome"]
pub struct OperationReceipt {
    receiver: oneshot::Receiver<OperationResult>,
}

impl OperationReceipt {
    pub(crate) fn channel() -> (oneshot::Sender<OperationResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    /// A receipt that is already resolved.
    pub fn ready(result: OperationResult) -> Self {
        let (sender, receipt) = Self::channel();
        let _ = sender.send(result);
        receipt
    }

    pub(crate) fn rejected(reason: crate::error::RejectReason) -> Self {
        Self::ready(Err(OperationError::Rejected(reason)))
    }
}

impl Future for OperationReceipt {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// What the worker operates on.
pub(crate) enum Target {
    Attribute(AttributeRef),
    Discovery,
}

struct Operation {
    seq: u64,
    kind: OperationKind,
    target: Target,
    payload: Vec<u8>,
    submitted: Instant,
    reply: oneshot::Sender<OperationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Attribute(AttributeHandle),
    Discovery,
}

struct Completion {
    status: GattStatus,
    value: Vec<u8>,
}

struct InFlight {
    seq: u64,
    expects: Expectation,
    signal: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Operation>,
    in_flight: Option<InFlight>,
    /// Attributes whose last operation timed out, until the given instant.
    stale: Vec<(AttributeHandle, Instant)>,
    closed: bool,
    next_seq: u64,
}

/// Everything the worker needs from the owning connection epoch.
pub(crate) struct QueueContext {
    pub peer: PeerIdentity,
    pub epoch: u64,
    pub link: LinkHandle,
    pub transport: Arc<dyn Transport>,
    pub errors: Arc<EventBus<ErrorEvent>>,
    pub operation_timeout: Duration,
    pub discovery_timeout: Duration,
    pub settle_delay: Duration,
    /// Asks the owner to tear the epoch down. Called from the worker.
    pub abort: Arc<dyn Fn(u64) + Send + Sync>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Notify,
    /// Signalled when a late completion is discarded.
    late: Notify,
    cancel: CancellationToken,
    ctx: QueueContext,
}

#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    /// Create the queue and start its worker on `runtime`.
    pub(crate) fn start(ctx: QueueContext, runtime: &Handle) -> Self {
        let queue = Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                late: Notify::new(),
                cancel: CancellationToken::new(),
                ctx,
            }),
        };
        let worker = queue.shared.clone();
        runtime.spawn(async move { worker.run().await });
        queue
    }

    pub fn epoch(&self) -> u64 {
        self.shared.ctx.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of operations waiting behind the one in flight.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub(crate) fn submit(
        &self,
        kind: OperationKind,
        target: Target,
        payload: Vec<u8>,
    ) -> OperationReceipt {
        let (reply, receipt) = OperationReceipt::channel();
        let mut state = self.shared.state.lock();
        if state.closed {
            let _ = reply.send(Err(OperationError::ConnectionClosed));
            return receipt;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        trace!("Queued {} #{} (epoch {})", kind, seq, self.shared.ctx.epoch);
        state.pending.push_back(Operation {
            seq,
            kind,
            target,
            payload,
            submitted: Instant::now(),
            reply,
        });
        self.shared.wake.notify_one();
        receipt
    }

    /// Route a transport completion to the in-flight operation.
    ///
    /// Returns false if nothing was waiting for `attr`, including completions
    /// that arrive late for an operation that already timed out.
    pub fn complete_attribute(&self, attr: AttributeHandle, status: GattStatus, value: Vec<u8>) -> bool {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        state.stale.retain(|(_, until)| *until > now);
        if let Some(i) = state.stale.iter().position(|(h, _)| *h == attr) {
            state.stale.remove(i);
            debug!("Discarding late completion for {} (status {})", attr, status);
            self.shared.late.notify_one();
            return false;
        }

        let matches = matches!(
            &state.in_flight,
            Some(f) if f.expects == Expectation::Attribute(attr)
        );
        if !matches {
            warn!("Unexpected completion for {} (status {})", attr, status);
            return false;
        }
        if let Some(in_flight) = state.in_flight.take() {
            trace!("Completion for #{} ({})", in_flight.seq, attr);
            let _ = in_flight.signal.send(Completion { status, value });
        }
        true
    }

    pub fn complete_discovery(&self, status: GattStatus) -> bool {
        let mut state = self.shared.state.lock();
        let matches = matches!(
            &state.in_flight,
            Some(f) if f.expects == Expectation::Discovery
        );
        if !matches {
            debug!("Discovery result with no discovery in flight (status {})", status);
            return false;
        }
        if let Some(in_flight) = state.in_flight.take() {
            let _ = in_flight.signal.send(Completion {
                status,
                value: Vec::new(),
            });
        }
        true
    }

    /// Close the queue: every waiting operation fails with `ConnectionClosed`
    /// before this returns, and the worker abandons the in-flight one.
    pub fn shutdown(&self) {
        let (pending, in_flight) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (std::mem::take(&mut state.pending), state.in_flight.take())
        };
        drop(in_flight);
        let count = pending.len();
        for op in pending {
            let _ = op.reply.send(Err(OperationError::ConnectionClosed));
        }
        self.shared.cancel.cancel();
        info!(
            "Command queue for epoch {} shut down ({} queued operations aborted)",
            self.shared.ctx.epoch, count
        );
    }
}

impl QueueShared {
    async fn run(self: Arc<Self>) {
        debug!("Command queue worker started (epoch {})", self.ctx.epoch);
        while let Some(op) = self.next_operation().await {
            let seq = op.seq;
            let kind = op.kind;
            let waited = op.submitted.elapsed();
            trace!("Starting {} #{} after {:?} in queue", kind, seq, waited);
            match op.target {
                Target::Discovery => {
                    let outcome = self.discover(seq).await;
                    let _ = op.reply.send(outcome);
                }
                Target::Attribute(ref attribute) => {
                    let outcome = self.operate(seq, kind, attribute, &op.payload).await;
                    let _ = op.reply.send(outcome);
                }
            }
        }
        debug!("Command queue worker stopped (epoch {})", self.ctx.epoch);
    }

    async fn next_operation(&self) -> Option<Operation> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(op) = state.pending.pop_front() {
                    return Some(op);
                }
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Mark `expects` as in flight. Fails if the queue closed meanwhile.
    fn arm(&self, seq: u64, expects: Expectation) -> Result<oneshot::Receiver<Completion>, OperationError> {
        let (signal, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(OperationError::ConnectionClosed);
        }
        state.in_flight = Some(InFlight {
            seq,
            expects,
            signal,
        });
        Ok(receiver)
    }

    fn disarm(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.in_flight.as_ref().map(|f| f.seq) == Some(seq) {
            state.in_flight = None;
        }
    }

    /// Wait for the armed completion, the deadline, or shutdown.
    async fn wait(
        &self,
        receiver: oneshot::Receiver<Completion>,
        deadline: Duration,
    ) -> Result<Vec<u8>, OperationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OperationError::ConnectionClosed),
            result = tokio::time::timeout(deadline, receiver) => match result {
                Ok(Ok(completion)) if completion.status.is_success() => Ok(completion.value),
                Ok(Ok(completion)) => Err(OperationError::Gatt(completion.status)),
                Ok(Err(_)) => Err(OperationError::ConnectionClosed),
                Err(_) => Err(OperationError::TimedOut(deadline)),
            },
        }
    }

    async fn discover(&self, seq: u64) -> Result<Vec<u8>, OperationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(OperationError::ConnectionClosed),
            _ = tokio::time::sleep(self.ctx.settle_delay) => {}
        }

        let receiver = self.arm(seq, Expectation::Discovery)?;
        info!("Discovering services on {} (epoch {})", self.ctx.peer, self.ctx.epoch);
        let outcome = match self.ctx.transport.discover_attributes(self.ctx.link) {
            Ok(()) => self.wait(receiver, self.ctx.discovery_timeout).await,
            Err(e) => Err(e.into()),
        };
        self.disarm(seq);

        if let Err(e) = &outcome {
            if *e != OperationError::ConnectionClosed {
                error!("Service discovery on {} failed: {}", self.ctx.peer, e);
                self.report(ErrorSource::Discovery, e.clone());
                (self.ctx.abort)(self.ctx.epoch);
            }
        }
        outcome
    }

    async fn operate(
        &self,
        seq: u64,
        kind: OperationKind,
        attribute: &AttributeRef,
        payload: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        let handle = attribute.handle();
        self.outwait_late_completion(handle).await?;
        let receiver = self.arm(seq, Expectation::Attribute(handle))?;

        if matches!(kind, OperationKind::Write | OperationKind::Subscribe) {
            attribute.set_value(payload);
        }

        let issued = match kind {
            OperationKind::Read => self.ctx.transport.read_attribute(self.ctx.link, handle),
            OperationKind::Write => self
                .ctx
                .transport
                .write_attribute(self.ctx.link, handle, payload),
            OperationKind::Subscribe => {
                let enabled = payload != DISABLE_NOTIFICATION_VALUE.as_slice();
                self.ctx
                    .transport
                    .set_notify(self.ctx.link, attribute.characteristic().handle(), enabled)
                    .and_then(|_| {
                        self.ctx
                            .transport
                            .write_attribute(self.ctx.link, handle, payload)
                    })
            }
            OperationKind::Discover => Err(TransportError::Other(
                "discovery is not an attribute operation".to_string(),
            )),
        };

        let outcome = match issued {
            Ok(()) => {
                let outcome = self.wait(receiver, self.ctx.operation_timeout).await;
                if let Err(OperationError::TimedOut(after)) = &outcome {
                    let mut state = self.state.lock();
                    state.stale.push((handle, Instant::now() + *after));
                }
                outcome
            }
            Err(e) => {
                let fatal = e == TransportError::HandleUnusable;
                let outcome: Result<Vec<u8>, OperationError> = Err(e.into());
                if fatal {
                    self.disarm(seq);
                    self.fail(kind, handle, &outcome);
                    (self.ctx.abort)(self.ctx.epoch);
                    return outcome;
                }
                outcome
            }
        };
        self.disarm(seq);

        let outcome = match outcome {
            Ok(value) => self.run_hooks(kind, attribute, value),
            Err(e) => Err(e),
        };
        self.fail(kind, handle, &outcome);
        outcome
    }

    /// Hold off issuing on `attr` while a timed-out operation on it may still
    /// complete, so that completion cannot be taken for the new one's.
    async fn outwait_late_completion(&self, attr: AttributeHandle) -> Result<(), OperationError> {
        loop {
            let until = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.stale.retain(|(_, until)| *until > now);
                match state.stale.iter().find(|(h, _)| *h == attr) {
                    Some((_, until)) => *until,
                    None => return Ok(()),
                }
            };
            debug!("Waiting for a late completion on {} before reissuing", attr);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OperationError::ConnectionClosed),
                _ = tokio::time::sleep_until(until) => {}
                _ = self.late.notified() => {}
            }
        }
    }

    /// Apply a successful result to the attribute and call the owning
    /// service's hook. A panicking hook turns the outcome into `Fatal`.
    fn run_hooks(&self, kind: OperationKind, attribute: &AttributeRef, value: Vec<u8>) -> Result<Vec<u8>, OperationError> {
        let hooked = catch_unwind(AssertUnwindSafe(|| match kind {
            OperationKind::Read => {
                attribute.set_value(&value);
                attribute.run_read_hook();
            }
            _ => attribute.run_write_hook(),
        }));
        match hooked {
            Ok(()) => {
                trace!("{} {} ok: {:02X?}", kind, attribute.handle(), value);
                Ok(value)
            }
            Err(_) => Err(OperationError::Fatal(format!(
                "{} hook panicked for {}",
                kind,
                attribute.handle()
            ))),
        }
    }

    fn fail(&self, kind: OperationKind, attribute: AttributeHandle, outcome: &Result<Vec<u8>, OperationError>) {
        match outcome {
            Ok(_) | Err(OperationError::ConnectionClosed) => {}
            Err(e) => {
                warn!("{} {} on {} failed: {}", kind, attribute, self.ctx.peer, e);
                self.report(ErrorSource::Operation { kind, attribute }, e.clone());
            }
        }
    }

    fn report(&self, source: ErrorSource, error: OperationError) {
        self.ctx.errors.notify(ErrorEvent {
            peer: self.ctx.peer,
            source,
            error,
        });
    }
}
