// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream management acknowledgements (XEP-0198), without resumption

use core::fmt;
use std::collections::{vec_deque, VecDeque};

use crate::minidom::Element;

/// State for stream management
pub(crate) struct SmState {
    /// Last value seen from the remote stanza counter.
    outbound_base: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    /// Unacked stanzas in the order they were sent
    unacked_stanzas: VecDeque<Element>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SmError {
    RemoteAckedMoreStanzas {
        local_base: u32,
        queue_len: u32,
        remote_ctr: u32,
    },
    RemoteAckWentBackwards {
        local_base: u32,
        remote_ctr: u32,
    },
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
            } => {
                write!(f, "remote acked less stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
        }
    }
}

impl SmState {
    pub fn new() -> Self {
        SmState {
            outbound_base: 0,
            inbound_ctr: 0,
            unacked_stanzas: VecDeque::new(),
        }
    }

    /// Mark a stanza as sent and keep it until the peer acknowledges it.
    pub fn enqueue(&mut self, stanza: Element) {
        self.unacked_stanzas.push_back(stanza);
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Count one received stanza.
    pub fn handled(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Number of stanzas waiting for an acknowledgement
    pub fn unacked(&self) -> usize {
        self.unacked_stanzas.len()
    }

    /// Process remote `<a/>`
    ///
    /// Returns the newly acknowledged stanzas in the order they were sent.
    pub fn remote_acked(&mut self, h: u32) -> Result<vec_deque::Drain<'_, Element>, SmError> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 specifies that counters are mod 2^32, which is handy when
        // you use u32 data types :-).
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop > self.unacked_stanzas.len() {
            if to_drop as u32 > u32::MAX / 2 {
                // If we look at the stanza counter values as RFC 1982
                // values, a wrapping difference greater than half the
                // number space indicates a negative difference, i.e.
                // h went backwards.
                return Err(SmError::RemoteAckWentBackwards {
                    local_base: self.outbound_base,
                    remote_ctr: h,
                });
            }
            return Err(SmError::RemoteAckedMoreStanzas {
                local_base: self.outbound_base,
                queue_len: self.unacked_stanzas.len() as u32,
                remote_ctr: h,
            });
        }
        self.outbound_base = h;
        Ok(self.unacked_stanzas.drain(..to_drop))
    }
}
