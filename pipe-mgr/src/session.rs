// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Client sessions.
//!
//! Every table operation is bracketed by a prologue, which claims the caller's
//! session, and an epilogue, which releases it.  A session that is already
//! claimed can't be claimed again, so two calls issued under the same session
//! never overlap.  Sessions don't protect any table state on their own; that
//! is left to the profile and table locks taken inside the bracket.

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use slog::{o, trace, warn};

use crate::types::*;

#[derive(Debug, Default)]
struct SessionState {
    in_use: bool,
    // When the current holder entered the prologue
    since: Option<DateTime<Utc>>,
}

/// A session that is currently inside its bracket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub sess_hdl: SessHdl,
    pub since: DateTime<Utc>,
}

/// A fixed-size pool of sessions
pub struct SessionPool {
    log: slog::Logger,
    sessions: Vec<Mutex<SessionState>>,
}

/// A claimed session.  The epilogue runs when the guard is dropped.
pub struct SessionGuard<'a> {
    pool: &'a SessionPool,
    sess_hdl: SessHdl,
}

impl SessionGuard<'_> {
    pub fn sess_hdl(&self) -> SessHdl {
        self.sess_hdl
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.pool.epilogue(self.sess_hdl);
    }
}

impl SessionPool {
    pub fn new(log: &slog::Logger, size: usize) -> Self {
        SessionPool {
            log: log.new(o!("unit" => "sessions")),
            sessions: (0..size)
                .map(|_| Mutex::new(SessionState::default()))
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    fn session(
        &self,
        sess_hdl: SessHdl,
    ) -> PipeMgrResult<&Mutex<SessionState>> {
        self.sessions
            .get(sess_hdl as usize)
            .ok_or(PipeMgrError::InvalidSession(sess_hdl))
    }

    /// Claim a session.  Fails with `SessionBusy` if it is already claimed.
    pub fn prologue(&self, sess_hdl: SessHdl) -> PipeMgrResult<()> {
        let mut s = self.session(sess_hdl)?.lock();
        if s.in_use {
            return Err(PipeMgrError::SessionBusy(sess_hdl));
        }
        s.in_use = true;
        s.since = Some(Utc::now());
        trace!(self.log, "session {sess_hdl} claimed");
        Ok(())
    }

    /// Release a session.  Releasing a session that isn't claimed, or doesn't
    /// exist, is a no-op.
    pub fn epilogue(&self, sess_hdl: SessHdl) {
        if let Ok(s) = self.session(sess_hdl) {
            let mut s = s.lock();
            s.in_use = false;
            s.since = None;
            trace!(self.log, "session {sess_hdl} released");
        }
    }

    /// Claim a session for the lifetime of the returned guard
    pub fn enter(&self, sess_hdl: SessHdl) -> PipeMgrResult<SessionGuard<'_>> {
        self.prologue(sess_hdl)?;
        Ok(SessionGuard {
            pool: self,
            sess_hdl,
        })
    }

    pub fn is_in_use(&self, sess_hdl: SessHdl) -> PipeMgrResult<bool> {
        Ok(self.session(sess_hdl)?.lock().in_use)
    }

    /// Every session currently inside its bracket, and since when
    pub fn in_use(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let s = s.lock();
                match (s.in_use, s.since) {
                    (true, Some(since)) => Some(SessionInfo {
                        sess_hdl: i as SessHdl,
                        since,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Release a session whose holder went away without running its
    /// epilogue.
    pub fn force_epilogue(&self, sess_hdl: SessHdl) -> PipeMgrResult<()> {
        let mut s = self.session(sess_hdl)?.lock();
        if let Some(since) = s.since.take() {
            warn!(self.log, "forcibly releasing session {sess_hdl}";
                "held_since" => %since);
        }
        s.in_use = false;
        Ok(())
    }
}
