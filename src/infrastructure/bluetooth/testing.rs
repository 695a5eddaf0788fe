//! Scriptable in-memory [`Transport`]
//!
//! Records every call and lets a test play the peer's side by pushing
//! completions back through the sink bound to a link.

use crate::domain::models::{AttributeHandle, ConnectionState, GattStatus, PeerIdentity};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    LinkHandle, NativeService, Transport, TransportSink,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        peer: PeerIdentity,
        link: LinkHandle,
    },
    Reconnect {
        peer: PeerIdentity,
        link: LinkHandle,
    },
    Disconnect {
        link: LinkHandle,
    },
    Close {
        link: LinkHandle,
    },
    Discover {
        link: LinkHandle,
    },
    Read {
        link: LinkHandle,
        attr: AttributeHandle,
    },
    Write {
        link: LinkHandle,
        attr: AttributeHandle,
        value: Vec<u8>,
    },
    SetNotify {
        link: LinkHandle,
        attr: AttributeHandle,
        enabled: bool,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<TransportCall>,
    sinks: HashMap<LinkHandle, TransportSink>,
    unavailable: HashSet<PeerIdentity>,
    names: HashMap<PeerIdentity, String>,
    failures: VecDeque<TransportError>,
    next_link: u64,
    last_link: Option<LinkHandle>,
    outstanding: usize,
    max_outstanding: usize,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    changed: Notify,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Wait until at least `count` calls were recorded.
    pub async fn wait_for_calls(&self, count: usize) {
        self.wait_for(|calls| calls.len() >= count).await
    }

    /// Wait until `predicate` holds for the recorded calls.
    pub async fn wait_for(&self, predicate: impl Fn(&[TransportCall]) -> bool) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if predicate(self.state.lock().calls.as_slice()) {
                return;
            }
            changed.await;
        }
    }

    pub fn set_available(&self, peer: PeerIdentity, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.unavailable.remove(&peer);
        } else {
            state.unavailable.insert(peer);
        }
    }

    pub fn set_name(&self, peer: PeerIdentity, name: &str) {
        self.state.lock().names.insert(peer, name.to_string());
    }

    /// Make the next fallible call fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().failures.push_back(error);
    }

    /// Highest number of reads, writes and discoveries awaiting completion
    /// at the same time.
    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    pub fn last_link(&self) -> Option<LinkHandle> {
        self.state.lock().last_link
    }

    pub fn sink(&self, link: LinkHandle) -> Option<TransportSink> {
        self.state.lock().sinks.get(&link).cloned()
    }

    // ---- peer side ----------------------------------------------------------

    pub fn signal_connected(&self, link: LinkHandle) {
        if let Some(sink) = self.sink(link) {
            sink.connection_state_changed(GattStatus::SUCCESS, ConnectionState::Connected);
        }
    }

    pub fn signal_disconnected(&self, link: LinkHandle, status: GattStatus) {
        self.state.lock().outstanding = 0;
        if let Some(sink) = self.sink(link) {
            sink.connection_state_changed(status, ConnectionState::Disconnected);
        }
    }

    pub fn signal_discovered(&self, link: LinkHandle, status: GattStatus, services: Vec<NativeService>) {
        let sink = self.settle(link);
        if let Some(sink) = sink {
            sink.discovery_complete(status, services);
        }
    }

    pub fn complete(&self, link: LinkHandle, attr: AttributeHandle, status: GattStatus, value: &[u8]) {
        let sink = self.settle(link);
        if let Some(sink) = sink {
            sink.operation_complete(attr, status, value.to_vec());
        }
    }

    pub fn signal_value(&self, link: LinkHandle, attr: AttributeHandle, value: &[u8]) {
        if let Some(sink) = self.sink(link) {
            sink.value_changed(attr, value.to_vec());
        }
    }

    fn settle(&self, link: LinkHandle) -> Option<TransportSink> {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.sinks.get(&link).cloned()
    }

    // ---- bookkeeping --------------------------------------------------------

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
        self.changed.notify_waiters();
    }

    fn record_fallible(&self, call: TransportCall, awaits_completion: bool) -> Result<(), TransportError> {
        let failure = {
            let mut state = self.state.lock();
            state.calls.push(call);
            let failure = state.failures.pop_front();
            if failure.is_none() && awaits_completion {
                state.outstanding += 1;
                state.max_outstanding = state.max_outstanding.max(state.outstanding);
            }
            failure
        };
        self.changed.notify_waiters();
        failure.map_or(Ok(()), Err)
    }
}

impl Transport for MockTransport {
    fn connect(&self, peer: PeerIdentity, sink: TransportSink) -> Result<LinkHandle, TransportError> {
        let link = {
            let mut state = self.state.lock();
            state.next_link += 1;
            LinkHandle(state.next_link)
        };
        self.record_fallible(TransportCall::Connect { peer, link }, false)?;
        let mut state = self.state.lock();
        state.sinks.insert(link, sink);
        state.last_link = Some(link);
        Ok(link)
    }

    fn reconnect(
        &self,
        peer: PeerIdentity,
        link: LinkHandle,
        sink: TransportSink,
    ) -> Result<LinkHandle, TransportError> {
        self.record_fallible(TransportCall::Reconnect { peer, link }, false)?;
        let mut state = self.state.lock();
        state.sinks.insert(link, sink);
        state.last_link = Some(link);
        Ok(link)
    }

    fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError> {
        self.record_fallible(TransportCall::Disconnect { link }, false)
    }

    fn close(&self, link: LinkHandle) {
        self.state.lock().sinks.remove(&link);
        self.record(TransportCall::Close { link });
    }

    fn discover_attributes(&self, link: LinkHandle) -> Result<(), TransportError> {
        self.record_fallible(TransportCall::Discover { link }, true)
    }

    fn read_attribute(&self, link: LinkHandle, attr: AttributeHandle) -> Result<(), TransportError> {
        self.record_fallible(TransportCall::Read { link, attr }, true)
    }

    fn write_attribute(
        &self,
        link: LinkHandle,
        attr: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record_fallible(
            TransportCall::Write {
                link,
                attr,
                value: value.to_vec(),
            },
            true,
        )
    }

    fn set_notify(&self, link: LinkHandle, attr: AttributeHandle, enabled: bool) -> Result<(), TransportError> {
        self.record_fallible(TransportCall::SetNotify { link, attr, enabled }, false)
    }

    fn is_available(&self, peer: PeerIdentity) -> bool {
        !self.state.lock().unavailable.contains(&peer)
    }

    fn peer_name(&self, peer: PeerIdentity) -> Option<String> {
        self.state.lock().names.get(&peer).cloned()
    }
}
