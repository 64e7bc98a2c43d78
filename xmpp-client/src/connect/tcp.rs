// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `TcpConnectionFactory` opens plain TCP connections

use std::io;
use std::net::SocketAddr;

use futures::{future::BoxFuture, FutureExt};
use tokio::net::TcpStream;

use crate::connect::{Connection, ConnectionFactory};

/// Connect directly over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self, target: SocketAddr) -> BoxFuture<'_, io::Result<Connection>> {
        async move {
            log::debug!("Attempting TCP connection to {target}");
            let stream = TcpStream::connect(target).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as Connection)
        }
        .boxed()
    }
}
