// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `Connector` turns a [`ServerLocator`] into a raw connection

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connect::dns::{sort_srv_records, Resolver, ServerLocator};
use crate::connect::{Connection, ConnectionFactory};
use crate::error::ConnectorError;
use crate::options::DEFAULT_CONNECT_TIMEOUT;

/// Resolves the server and tries every candidate address with every
/// factory, strictly one after the other, until one connection succeeds.
///
/// Candidates come from the SRV records of the locator (by priority, then
/// weight). Only when there are none is the locator's host itself looked
/// up directly. Each address is tried
/// against the factories in plan order. The whole sequence is bounded by a
/// single timeout.
pub struct Connector {
    locator: ServerLocator,
    resolver: Arc<dyn Resolver>,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    timeout: Duration,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connector")
            .field("locator", &self.locator)
            .field("factories", &self.factories)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Connector {
    /// Create a connector with the default timeout
    pub fn new(
        locator: ServerLocator,
        resolver: Arc<dyn Resolver>,
        factories: Vec<Arc<dyn ConnectionFactory>>,
    ) -> Self {
        Connector {
            locator,
            resolver,
            factories,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Change the overall timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Produce a connection or the reason why none could be made.
    pub async fn connect(&self) -> Result<Connection, ConnectorError> {
        match tokio::time::timeout(self.timeout, self.try_candidates()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Connecting to {} timed out", self.locator);
                Err(ConnectorError::Timeout)
            }
        }
    }

    async fn targets(&self) -> Vec<(String, u16)> {
        if let Some(name) = self.locator.srv_name() {
            debug!("Querying SRV records for {name}");
            match self.resolver.lookup_srv(&name).await {
                Ok(mut records) if !records.is_empty() => {
                    sort_srv_records(&mut records);
                    return records
                        .into_iter()
                        .map(|srv| (srv.target, srv.port))
                        .collect();
                }
                Ok(_) => debug!("No SRV records for {name}"),
                Err(e) => debug!("SRV lookup for {name} failed: {e}"),
            }
        }
        vec![(self.locator.host.clone(), self.locator.fallback_port())]
    }

    async fn try_candidates(&self) -> Result<Connection, ConnectorError> {
        let mut resolved_any = false;
        for (host, port) in self.targets().await {
            let addresses = match self.resolver.lookup_addresses(&host).await {
                Ok(addresses) if !addresses.is_empty() => addresses,
                Ok(_) => {
                    debug!("No addresses found for {host}");
                    continue;
                }
                Err(e) => {
                    debug!("Address lookup for {host} failed: {e}");
                    continue;
                }
            };
            resolved_any = true;
            for ip in addresses {
                let target = SocketAddr::new(ip, port);
                for factory in &self.factories {
                    match factory.connect(target).await {
                        Ok(connection) => {
                            debug!("Connected to {target} through {factory:?}");
                            return Ok(connection);
                        }
                        Err(e) => debug!("Connecting to {target} through {factory:?} failed: {e}"),
                    }
                }
            }
        }
        if resolved_any {
            Err(ConnectorError::ConnectionFailed)
        } else {
            Err(ConnectorError::DomainNameResolve)
        }
    }

    /// Run the connector on the runtime.
    ///
    /// `on_finished` is called exactly once, with the connection or the
    /// failure, unless the returned handle is dropped or aborted first.
    pub fn start<F>(self, on_finished: F) -> ConnectorHandle
    where
        F: FnOnce(Result<Connection, ConnectorError>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ConnectorError::Cancelled),
                result = self.connect() => result,
            };
            on_finished(result);
        });
        ConnectorHandle { cancel, task }
    }
}

/// Handle to a running [`Connector`]
///
/// Dropping the handle aborts the connector without calling back.
#[derive(Debug)]
pub struct ConnectorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    /// Abort any in-flight lookup or connection attempt; the completion
    /// callback then reports [`ConnectorError::Cancelled`].
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Has the completion callback already run?
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ConnectorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
