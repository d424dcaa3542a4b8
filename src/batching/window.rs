//! Batch window state machine.
//!
//! A window collects members that share a group key until either trigger
//! fires: it holds `max_size` members or the union of their ids reaches
//! `max_size`, or `max_wait` has elapsed since the first member arrived. Both triggers race on
//! [`BatchWindow::try_begin_flush`]; exactly one of them wins.

use crate::core::error::ProxyResult;
use crate::upstream::FetchedBody;
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// Lifecycle of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accepting members
    Open,
    /// Flush claimed; the upstream call is running
    Flushing,
    /// Results delivered
    Closed,
}

/// What one caller asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchMember {
    /// `products/{id}`: answered with one object
    Single(u64),
    /// `products?include=a,b,c`: answered with the found objects, in order
    Multiple(Vec<u64>),
}

impl BatchMember {
    pub fn ids(&self) -> &[u64] {
        match self {
            Self::Single(id) => std::slice::from_ref(id),
            Self::Multiple(ids) => ids,
        }
    }
}

/// A member waiting for its slice of the flush
pub struct PendingMember {
    pub member: BatchMember,
    pub reply: oneshot::Sender<ProxyResult<FetchedBody>>,
}

/// Everything a flush needs, taken out of the window when it starts
pub struct FlushBatch {
    pub group_key: String,
    pub shared_params: Vec<(String, String)>,
    /// De-duplicated union of member ids, in arrival order
    pub ids: Vec<u64>,
    pub members: Vec<PendingMember>,
    pub waited: std::time::Duration,
}

struct WindowInner {
    state: WindowState,
    ids: Vec<u64>,
    members: Vec<PendingMember>,
}

pub struct BatchWindow {
    group_key: String,
    shared_params: Vec<(String, String)>,
    max_size: usize,
    opened_at: Instant,
    inner: Mutex<WindowInner>,
}

impl BatchWindow {
    /// Open a window around its first member. Returns the window and whether
    /// that member alone already fills it.
    pub fn open(
        group_key: String,
        shared_params: Vec<(String, String)>,
        max_size: usize,
        first: PendingMember,
    ) -> (Self, bool) {
        let mut ids = Vec::with_capacity(max_size);
        merge_ids(&mut ids, first.member.ids());
        let full = ids.len() >= max_size;

        let window = Self {
            group_key,
            shared_params,
            max_size,
            opened_at: Instant::now(),
            inner: Mutex::new(WindowInner {
                state: WindowState::Open,
                ids,
                members: vec![first],
            }),
        };
        (window, full)
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn state(&self) -> WindowState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == WindowState::Open
    }

    /// Number of distinct ids collected so far
    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a member. `Ok(full)` reports whether the window reached capacity;
    /// `Err` hands the member back when the window is no longer open, already
    /// holds `max_size` members, or the member's ids would push it past
    /// `max_size`.
    pub fn try_add(&self, pending: PendingMember) -> Result<bool, PendingMember> {
        let mut inner = self.inner.lock();
        if inner.state != WindowState::Open || inner.members.len() >= self.max_size {
            return Err(pending);
        }

        let new_ids = pending
            .member
            .ids()
            .iter()
            .filter(|id| !inner.ids.contains(id))
            .count();
        if inner.ids.len() + new_ids > self.max_size {
            return Err(pending);
        }

        merge_ids(&mut inner.ids, pending.member.ids());
        inner.members.push(pending);
        Ok(inner.ids.len() >= self.max_size || inner.members.len() >= self.max_size)
    }

    /// Claim the flush. Succeeds once, for whichever trigger gets here first.
    pub fn try_begin_flush(&self) -> Option<FlushBatch> {
        let mut inner = self.inner.lock();
        if inner.state != WindowState::Open {
            return None;
        }
        inner.state = WindowState::Flushing;

        Some(FlushBatch {
            group_key: self.group_key.clone(),
            shared_params: self.shared_params.clone(),
            ids: std::mem::take(&mut inner.ids),
            members: std::mem::take(&mut inner.members),
            waited: self.opened_at.elapsed(),
        })
    }

    pub fn close(&self) {
        self.inner.lock().state = WindowState::Closed;
    }
}

fn merge_ids(into: &mut Vec<u64>, ids: &[u64]) {
    for id in ids {
        if !into.contains(id) {
            into.push(*id);
        }
    }
}
