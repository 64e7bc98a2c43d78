// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use xmpp_parsers::{
    iq::{Iq, IqType},
    stanza_error::StanzaError,
};

use crate::{event::make_id, jid::Jid, minidom::Element};

/// An IQ request payload
#[derive(Debug, Clone)]
pub enum IqRequest {
    /// Payload for a `type="get"` request
    Get(Element),

    /// Payload for a `type="set"` request
    Set(Element),
}

impl From<IqRequest> for IqType {
    fn from(other: IqRequest) -> IqType {
        match other {
            IqRequest::Get(v) => Self::Get(v),
            IqRequest::Set(v) => Self::Set(v),
        }
    }
}

/// An IQ response payload
#[derive(Debug, Clone)]
pub enum IqResponse {
    /// Payload for a `type="result"` response.
    Result(Option<Element>),

    /// Payload for a `type="error"` response.
    Error(StanzaError),
}

impl From<IqResponse> for IqType {
    fn from(other: IqResponse) -> IqType {
        match other {
            IqResponse::Result(v) => Self::Result(v),
            IqResponse::Error(v) => Self::Error(v),
        }
    }
}

/// Error enumeration for Iq sending failures
#[derive(Debug)]
pub enum IqFailure {
    /// The stanza channel became unavailable before the response arrived.
    ChannelUnavailable,

    /// The IQ could not be handed to the session.
    SendError(io::Error),
}

impl fmt::Display for IqFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ChannelUnavailable => {
                f.write_str("stanza channel became unavailable while waiting for the IQ response")
            }
            Self::SendError(e) => write!(f, "send error: {e}"),
        }
    }
}

impl Error for IqFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SendError(ref e) => Some(e),
            Self::ChannelUnavailable => None,
        }
    }
}

type IqKey = (Option<Jid>, String);
type IqMap = BTreeMap<IqKey, IqResponseSink>;

struct IqMapEntryHandle {
    key: IqKey,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let Some(mut map) = map.lock().ok() else {
            return;
        };
        map.remove(&self.key);
    }
}

pin_project_lite::pin_project! {
    /// Handle for awaiting an IQ response.
    ///
    /// The `IqResponseToken` can be awaited and will generate a result once
    /// the Iq response has been received. Note that an `Ok(_)` result does
    /// **not** imply a successful execution of the remote command: It may
    /// contain a [`IqResponse::Error`] variant.
    ///
    /// There are no internal timeouts for Iq responses. The token resolves
    /// with [`IqFailure::ChannelUnavailable`] when the session ends, so
    /// combine it with something like [`tokio::time::timeout`] if the peer
    /// may never answer.
    ///
    /// Dropping (cancelling) an `IqResponseToken` removes the internal
    /// bookkeeping required for tracking the response.
    pub struct IqResponseToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        inner: oneshot::Receiver<Result<IqResponse, IqFailure>>,
    }
}

impl IqResponseToken {
    /// A token that has already failed.
    pub(crate) fn failed(failure: IqFailure) -> Self {
        let (tx, rx) = oneshot::channel();
        let _: Result<_, _> = tx.send(Err(failure));
        IqResponseToken {
            entry: None,
            inner: rx,
        }
    }
}

impl Future for IqResponseToken {
    type Output = Result<IqResponse, IqFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => {
                // Drop the map entry handle to release some memory.
                this.entry.take();
                Poll::Ready(v)
            }
            Poll::Ready(Err(_)) => {
                log::warn!("IqResponseToken oneshot::Receiver returned receive error!");
                this.entry.take();
                Poll::Ready(Err(IqFailure::ChannelUnavailable))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for IqResponseToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IqResponseToken")
            .field("tracked", &self.entry.is_some())
            .finish()
    }
}

struct IqResponseSink {
    inner: oneshot::Sender<Result<IqResponse, IqFailure>>,
}

impl IqResponseSink {
    fn complete(self, resp: IqResponse) {
        let _: Result<_, _> = self.inner.send(Ok(resp));
    }

    fn fail(self, failure: IqFailure) {
        let _: Result<_, _> = self.inner.send(Err(failure));
    }
}

/// Correlates outgoing IQ requests with their responses.
///
/// Requests are keyed by recipient and `id`; a response only matches when it
/// comes from the entity the request was sent to.
pub(crate) struct IqRouter {
    map: Arc<Mutex<IqMap>>,
}

impl IqRouter {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(IqMap::new())),
        }
    }

    /// Number of requests still waiting for a response
    pub fn pending(&self) -> usize {
        self.map.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Attempt to handle an IQ stanza as IQ response.
    ///
    /// `own_jid` is the bound JID; responses to requests sent without a
    /// `to` may come from its bare form or from the server's domain.
    ///
    /// Returns the IQ stanza unharmed if it is a request. Responses are
    /// consumed: delivered to the matching request, or dropped when none is
    /// tracked.
    pub fn handle_iq(&self, iq: Iq, own_jid: &Jid) -> ControlFlow<(), Iq> {
        let payload = match iq.payload {
            IqType::Error(error) => IqResponse::Error(error),
            IqType::Result(result) => IqResponse::Result(result),
            _ => return ControlFlow::Continue(iq),
        };
        let from_own_server = match &iq.from {
            None => true,
            Some(from) => {
                *from == Jid::from(own_jid.to_bare()) || from.as_str() == own_jid.domain().as_str()
            }
        };
        let key = (iq.from, iq.id);
        let Ok(mut map) = self.map.lock() else {
            return ControlFlow::Break(());
        };
        let sink = match map.remove(&key) {
            Some(sink) => Some(sink),
            None if from_own_server => map.remove(&(None, key.1.clone())),
            None => None,
        };
        match sink {
            None => {
                log::warn!(
                    "Dropping IQ response from {:?} with id {:?}: no pending request",
                    key.0,
                    key.1
                );
            }
            Some(sink) => sink.complete(payload),
        }
        ControlFlow::Break(())
    }

    /// Allocate a new IQ response tracking handle.
    ///
    /// This builds the IQ with a unique ID.
    pub fn allocate_iq_handle(
        &self,
        from: Option<Jid>,
        to: Option<Jid>,
        req: IqRequest,
    ) -> (Iq, IqResponseToken) {
        let (tx, rx) = oneshot::channel();
        let mut key = (to, make_id());
        if let Ok(mut map) = self.map.lock() {
            while map.contains_key(&key) {
                key.1 = make_id();
            }
            map.insert(key.clone(), IqResponseSink { inner: tx });
        }
        let token = IqResponseToken {
            entry: Some(IqMapEntryHandle {
                key: key.clone(),
                map: Arc::downgrade(&self.map),
            }),
            inner: rx,
        };
        (
            Iq {
                from,
                to: key.0,
                id: key.1,
                payload: req.into(),
            },
            token,
        )
    }

    /// Fail every pending request once.
    pub fn fail_all(&self) {
        let Ok(mut map) = self.map.lock() else {
            return;
        };
        let pending = std::mem::take(&mut *map);
        if !pending.is_empty() {
            log::debug!("Failing {} pending IQ requests", pending.len());
        }
        for (_, sink) in pending {
            sink.fail(IqFailure::ChannelUnavailable);
        }
    }
}
