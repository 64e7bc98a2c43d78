// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use futures::{ready, task::Poll, Stream};
use std::pin::Pin;
use std::task::Context;

use crate::{client::Client, Event};

/// Incoming XMPP events
///
/// In an `async fn` you may want to use this with `use
/// futures::stream::StreamExt;`
impl Stream for Client {
    type Item = Event;

    /// Drives the completions of the background machinery that:
    ///
    /// * connects,
    /// * starttls,
    /// * authenticates,
    /// * binds a resource, and finally
    /// * receives stanzas
    ///
    /// ...for your client. Observers registered on the client and its
    /// [`channel`](Client::channel) are invoked from here.
    ///
    /// The stream never ends: a disconnected client can connect again.
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            let Some(tagged) = ready!(self.rx.poll_recv(cx)) else {
                return Poll::Ready(None);
            };
            if let Some(event) = self.accept(tagged) {
                return Poll::Ready(Some(event));
            }
        }
    }
}
