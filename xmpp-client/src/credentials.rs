// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Password handling.

use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// A password whose memory is wiped when it is cleared or dropped.
///
/// A `Password` handed to a session is consumed by exactly one
/// authentication attempt.
#[derive(Clone, Default)]
pub struct Password(Zeroizing<String>);

impl Password {
    /// Wrap a password.
    pub fn new<S: Into<String>>(password: S) -> Password {
        Password(Zeroizing::new(password.into()))
    }

    /// Borrow the clear-text password.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Is this password empty (or already cleared)?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the password in memory. This cannot be undone.
    pub fn clear(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("Password(<redacted>)")
    }
}

impl From<&str> for Password {
    fn from(other: &str) -> Password {
        Password::new(other)
    }
}

impl From<String> for Password {
    fn from(other: String) -> Password {
        Password::new(other)
    }
}

/// Client-side store for the account password.
///
/// With `forget` set, the password leaves the store the first time it is
/// handed out, and anything still stored is wiped by [`purge`].
///
/// [`purge`]: CredentialStore::purge
#[derive(Debug, Default)]
pub(crate) struct CredentialStore {
    password: Option<Password>,
    forget: bool,
}

impl CredentialStore {
    pub fn new(password: Option<Password>) -> CredentialStore {
        CredentialStore {
            password: password.filter(|p| !p.is_empty()),
            forget: false,
        }
    }

    pub fn set_forget(&mut self, forget: bool) {
        self.forget = forget;
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Hand out the password for one authentication attempt.
    pub fn provide(&mut self) -> Option<Password> {
        if self.forget {
            self.password.take()
        } else {
            self.password.clone()
        }
    }

    pub fn purge(&mut self) {
        if !self.forget {
            return;
        }
        if let Some(mut password) = self.password.take() {
            password.clear();
            log::trace!("Stored password wiped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_wipes_content() {
        let mut password = Password::new("hunter2");
        assert_eq!(password.expose(), "hunter2");
        password.clear();
        assert!(password.is_empty());
        assert_eq!(password.expose(), "");
    }

    #[test]
    fn debug_does_not_leak() {
        let password = Password::new("hunter2");
        assert!(!format!("{:?}", password).contains("hunter2"));
    }

    #[test]
    fn forgetting_store_hands_out_password_once() {
        let mut store = CredentialStore::new(Some("hunter2".into()));
        store.set_forget(true);
        let first = store.provide().unwrap();
        assert_eq!(first.expose(), "hunter2");
        assert!(!store.has_password());
        // A retry does not find the original password anymore.
        assert!(store.provide().is_none());
    }

    #[test]
    fn keeping_store_hands_out_copies() {
        let mut store = CredentialStore::new(Some("hunter2".into()));
        assert_eq!(store.provide().unwrap().expose(), "hunter2");
        assert_eq!(store.provide().unwrap().expose(), "hunter2");
        store.purge();
        assert!(store.has_password());
    }

    #[test]
    fn purge_wipes_unused_password() {
        let mut store = CredentialStore::new(Some("hunter2".into()));
        store.set_forget(true);
        store.purge();
        assert!(store.provide().is_none());
    }

    #[test]
    fn empty_password_is_no_password() {
        let mut store = CredentialStore::new(Some("".into()));
        assert!(store.provide().is_none());
    }
}
