//! Concurrency groups: at most one active run per key.

use gantry_core::RunId;
use gantry_core::run::CancelReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

/// Cancellation signal for one run. The first reason wins.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Returns false if the run was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CancelReason>> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the handle's run has been cancelled.
pub async fn cancelled(rx: &mut watch::Receiver<Option<CancelReason>>) -> CancelReason {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can cancel this run any more.
            std::future::pending::<()>().await;
        }
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancelHandle,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct GroupState {
    /// Highest ticket issued for this key, and the run it was issued to.
    latest: u64,
    latest_run: Option<RunId>,
    active: Option<ActiveRun>,
}

enum Attempt {
    Acquired(GroupSlot),
    Wait(watch::Receiver<bool>),
}

#[derive(Default)]
struct Inner {
    groups: Mutex<HashMap<String, GroupState>>,
    next_ticket: AtomicU64,
}

/// In-memory registry of concurrency groups, shared by every run of the process.
#[derive(Clone, Default)]
pub struct ConcurrencyGroups {
    inner: Arc<Inner>,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new arrival for `key` and return its ticket.
    ///
    /// Tickets order runs of one key by trigger arrival, so a run that reaches
    /// [`acquire`](Self::acquire) late cannot displace a newer one.
    pub fn reserve(&self, key: &str, run_id: RunId) -> u64 {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let mut groups = self.lock();
        let state = groups.entry(key.to_string()).or_default();
        if ticket > state.latest {
            state.latest = ticket;
            state.latest_run = Some(run_id);
        }
        ticket
    }

    /// Take the slot for `key`.
    ///
    /// With `cancel_in_progress` the current holder is cancelled and the slot
    /// is taken immediately; otherwise this waits for the holder to finish.
    /// Fails when a newer run of the same key has arrived meanwhile, or when
    /// `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        key: &str,
        ticket: u64,
        run_id: RunId,
        cancel_in_progress: bool,
        cancel: &CancelHandle,
    ) -> Result<GroupSlot, CancelReason> {
        let mut cancel_rx = cancel.subscribe();

        loop {
            let attempt = {
                let mut groups = self.lock();
                let state = groups.entry(key.to_string()).or_default();

                if state.latest > ticket
                    && let Some(newer) = state.latest_run
                {
                    debug!(key = %key, run_id = %run_id, newer = %newer, "Newer run arrived for group");
                    return Err(CancelReason::superseded(newer));
                }

                let waiting = match &state.active {
                    Some(active) if !cancel_in_progress => {
                        info!(
                            key = %key,
                            run_id = %run_id,
                            holder = %active.run_id,
                            "Waiting for concurrency group"
                        );
                        Some(active.done.clone())
                    }
                    Some(active) => {
                        info!(
                            key = %key,
                            cancelled = %active.run_id,
                            by = %run_id,
                            "Superseding in-progress run"
                        );
                        active.cancel.cancel(CancelReason::superseded(run_id));
                        None
                    }
                    None => None,
                };

                match waiting {
                    Some(done) => Attempt::Wait(done),
                    None => {
                        let (done_tx, done_rx) = watch::channel(false);
                        state.active = Some(ActiveRun {
                            run_id,
                            cancel: cancel.clone(),
                            done: done_rx,
                        });
                        Attempt::Acquired(GroupSlot {
                            groups: self.clone(),
                            key: key.to_string(),
                            run_id,
                            done: done_tx,
                        })
                    }
                }
            };

            match attempt {
                Attempt::Acquired(slot) => return Ok(slot),
                Attempt::Wait(mut done) => {
                    tokio::select! {
                        reason = cancelled(&mut cancel_rx) => return Err(reason),
                        _ = wait_done(&mut done) => {}
                    }
                }
            }
        }
    }

    /// Run currently holding `key`, if any.
    pub fn holder(&self, key: &str) -> Option<RunId> {
        self.lock()
            .get(key)
            .and_then(|state| state.active.as_ref().map(|a| a.run_id))
    }

    fn release(&self, key: &str, run_id: RunId) {
        let mut groups = self.lock();
        if let Some(state) = groups.get_mut(key)
            && state.active.as_ref().is_some_and(|a| a.run_id == run_id)
        {
            state.active = None;
            debug!(key = %key, run_id = %run_id, "Released concurrency group");
        }
    }
}

async fn wait_done(done: &mut watch::Receiver<bool>) {
    loop {
        if *done.borrow_and_update() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

/// Ownership of a concurrency group. Dropping it releases the group.
pub struct GroupSlot {
    groups: ConcurrencyGroups,
    key: String,
    run_id: RunId,
    done: watch::Sender<bool>,
}

impl GroupSlot {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GroupSlot {
    fn drop(&mut self) {
        self.groups.release(&self.key, self.run_id);
        let _ = self.done.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::run::CancelReasonType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_handle_first_reason_wins() {
        let handle = CancelHandle::new();
        let mut rx = handle.subscribe();
        assert!(!handle.is_cancelled());

        assert!(handle.cancel(CancelReason::fail_fast("Build (os=linux)")));
        assert!(!handle.cancel(CancelReason::superseded(RunId::new())));

        let reason = cancelled(&mut rx).await;
        assert_eq!(reason.reason, CancelReasonType::FailFast);
        assert_eq!(handle.reason(), Some(reason));
    }

    #[tokio::test]
    async fn test_supersede_cancels_holder() {
        let groups = ConcurrencyGroups::new();
        let (old_id, new_id) = (RunId::new(), RunId::new());
        let (old_cancel, new_cancel) = (CancelHandle::new(), CancelHandle::new());

        let old_ticket = groups.reserve("ci-main", old_id);
        let old_slot = groups
            .acquire("ci-main", old_ticket, old_id, true, &old_cancel)
            .await
            .unwrap();
        assert_eq!(groups.holder("ci-main"), Some(old_id));

        let new_ticket = groups.reserve("ci-main", new_id);
        let new_slot = groups
            .acquire("ci-main", new_ticket, new_id, true, &new_cancel)
            .await
            .unwrap();

        assert_eq!(
            old_cancel.reason().map(|r| r.reason),
            Some(CancelReasonType::Superseded)
        );
        assert_eq!(groups.holder("ci-main"), Some(new_id));

        // The superseded run releasing late must not free the new holder's slot.
        drop(old_slot);
        assert_eq!(groups.holder("ci-main"), Some(new_id));
        drop(new_slot);
        assert_eq!(groups.holder("ci-main"), None);
    }

    #[tokio::test]
    async fn test_stale_run_cannot_displace_newer() {
        let groups = ConcurrencyGroups::new();
        let (old_id, new_id) = (RunId::new(), RunId::new());

        let old_ticket = groups.reserve("ci-main", old_id);
        let new_ticket = groups.reserve("ci-main", new_id);

        let _slot = groups
            .acquire("ci-main", new_ticket, new_id, true, &CancelHandle::new())
            .await
            .unwrap();
        let stale = groups
            .acquire("ci-main", old_ticket, old_id, true, &CancelHandle::new())
            .await;

        assert!(stale.is_err());
        assert_eq!(groups.holder("ci-main"), Some(new_id));
    }

    #[tokio::test]
    async fn test_queue_waits_for_holder() {
        let groups = ConcurrencyGroups::new();
        let (first_id, second_id) = (RunId::new(), RunId::new());
        let first_cancel = CancelHandle::new();

        let first_ticket = groups.reserve("deploy", first_id);
        let first_slot = groups
            .acquire("deploy", first_ticket, first_id, false, &first_cancel)
            .await
            .unwrap();

        let second_ticket = groups.reserve("deploy", second_id);
        let waiter = {
            let groups = groups.clone();
            tokio::spawn(async move {
                let cancel = CancelHandle::new();
                groups
                    .acquire("deploy", second_ticket, second_id, false, &cancel)
                    .await
                    .map(|slot| slot.key().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(!first_cancel.is_cancelled());

        drop(first_slot);
        let key = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(key, "deploy");
    }

    #[tokio::test]
    async fn test_waiting_run_can_be_cancelled() {
        let groups = ConcurrencyGroups::new();
        let (first_id, second_id) = (RunId::new(), RunId::new());

        let first_ticket = groups.reserve("deploy", first_id);
        let _first_slot = groups
            .acquire("deploy", first_ticket, first_id, false, &CancelHandle::new())
            .await
            .unwrap();

        let second_ticket = groups.reserve("deploy", second_id);
        let second_cancel = CancelHandle::new();
        let waiter = {
            let groups = groups.clone();
            let cancel = second_cancel.clone();
            tokio::spawn(async move {
                groups
                    .acquire("deploy", second_ticket, second_id, false, &cancel)
                    .await
                    .is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        second_cancel.cancel(CancelReason::fail_fast("Deploy"));
        let acquired = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!acquired);
    }
}
