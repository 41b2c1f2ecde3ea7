//! Lock manager for OakDB
//!
//! Strict two-phase locking at table granularity with shared and exclusive
//! modes. Each lockable object has a request queue: a map of granted
//! requests plus a FIFO of waiters parked on a condition variable. A
//! background detector rebuilds the wait-for graph every 50ms and aborts
//! the youngest transaction on any cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use super::transaction::{LockDataId, Transaction, TransactionState, INVALID_TXN_ID};
use crate::error::{AbortReason, Error, Result, TxnId};

/// Detector period
const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Shared registry of live transactions, owned jointly with the
/// transaction manager so the detector can mark victims aborted.
pub type TxnMap = Arc<RwLock<HashMap<TxnId, Arc<Transaction>>>>;

/// Lock modes; X dominates S
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

#[derive(Default)]
struct QueueState {
    /// Currently granted requests
    granted: HashMap<TxnId, LockMode>,
    /// Pending requests in arrival order
    waiting: VecDeque<LockRequest>,
    /// Transaction currently upgrading S -> X, if any
    upgrading: TxnId,
}

/// Per-object lock queue
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                granted: HashMap::new(),
                waiting: VecDeque::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Lock manager
pub struct LockManager {
    /// Global lock table
    lock_table: Mutex<HashMap<LockDataId, Arc<LockRequestQueue>>>,
    /// Which queue each blocked transaction is parked on
    wait_for_lock_map: Mutex<HashMap<TxnId, Arc<LockRequestQueue>>>,
    /// Live transactions, shared with the transaction manager
    txns: TxnMap,
    detector_started: AtomicBool,
    detector_enabled: Arc<AtomicBool>,
}

impl LockManager {
    pub fn new(txns: TxnMap) -> Self {
        Self {
            lock_table: Mutex::new(HashMap::new()),
            wait_for_lock_map: Mutex::new(HashMap::new()),
            txns,
            detector_started: AtomicBool::new(false),
            detector_enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn queue_for(&self, id: LockDataId) -> Arc<LockRequestQueue> {
        self.lock_table
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    /// `mode` is grantable iff every granted request and every earlier
    /// waiter is shared alongside a shared request.
    fn is_compatible(state: &QueueState, mode: LockMode, txn_id: TxnId) -> bool {
        for (&holder, &held) in &state.granted {
            if holder == txn_id {
                continue;
            }
            if !(mode == LockMode::Shared && held == LockMode::Shared) {
                return false;
            }
        }
        for req in &state.waiting {
            if req.txn_id == txn_id {
                break;
            }
            if !(mode == LockMode::Shared && req.mode == LockMode::Shared) {
                return false;
            }
        }
        true
    }

    /// Acquire a table lock, blocking until granted or the transaction is
    /// aborted by the deadlock detector (in which case `Ok(false)`).
    pub fn lock_on_table(
        &self,
        txn: &Arc<Transaction>,
        tab_fd: i32,
        mode: LockMode,
    ) -> Result<bool> {
        match txn.state() {
            TransactionState::Aborted => return Ok(false),
            // Strict 2PL: once release has begun, nothing new is granted.
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                return Err(Error::TransactionAbort(
                    txn.id(),
                    AbortReason::LockOnShrinking,
                ));
            }
            _ => {}
        }
        let txn_id = txn.id();
        let lock_id = LockDataId::table(tab_fd);
        let queue = self.queue_for(lock_id);
        let mut state = queue.state.lock();

        // Fast path: already held at an equal or stronger mode.
        if let Some(&held) = state.granted.get(&txn_id) {
            if held == mode || held == LockMode::Exclusive {
                return Ok(true);
            }
            // S -> X upgrade: only one upgrader per queue.
            if state.upgrading != INVALID_TXN_ID {
                txn.set_state(TransactionState::Aborted);
                return Err(Error::TransactionAbort(txn_id, AbortReason::UpgradeConflict));
            }
            state.granted.remove(&txn_id);
            txn.remove_lock(&lock_id);
            state.upgrading = txn_id;
        }

        // Grant immediately if no one is in the way.
        if state.granted.is_empty() && (state.upgrading == txn_id || state.waiting.is_empty()) {
            if state.upgrading == txn_id {
                state.upgrading = INVALID_TXN_ID;
            }
            state.granted.insert(txn_id, mode);
            txn.add_lock(lock_id);
            return Ok(true);
        }

        self.wait_for_lock_map.lock().insert(txn_id, queue.clone());

        let request = LockRequest { txn_id, mode };
        if state.upgrading == txn_id {
            // An upgrader jumps the queue.
            state.waiting.push_front(request);
        } else {
            state.waiting.push_back(request);
        }
        debug!("txn {} waiting for table {} in {:?}", txn_id, tab_fd, mode);

        let granted = self.wait_until_grantable(txn, mode, &queue, &mut state);

        self.wait_for_lock_map.lock().remove(&txn_id);

        if !granted {
            // The detector aborted us while we slept.
            if let Some(pos) = state.waiting.iter().position(|r| r.txn_id == txn_id) {
                state.waiting.remove(pos);
            }
            if state.upgrading == txn_id {
                state.upgrading = INVALID_TXN_ID;
            }
            queue.cv.notify_all();
            return Ok(false);
        }

        if state.upgrading == txn_id {
            state.upgrading = INVALID_TXN_ID;
            state.waiting.pop_front();
        } else if let Some(pos) = state.waiting.iter().position(|r| r.txn_id == txn_id) {
            state.waiting.remove(pos);
        }
        state.granted.insert(txn_id, mode);
        txn.add_lock(lock_id);
        debug!("txn {} granted table {} in {:?}", txn_id, tab_fd, mode);
        Ok(true)
    }

    fn wait_until_grantable(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        queue: &Arc<LockRequestQueue>,
        state: &mut MutexGuard<'_, QueueState>,
    ) -> bool {
        loop {
            if txn.state() == TransactionState::Aborted {
                return false;
            }
            let head = state.waiting.front().copied();
            let head_ok = match head {
                Some(head) => Self::is_compatible(&**state, head.mode, head.txn_id),
                None => true,
            };
            if head_ok && Self::is_compatible(&**state, mode, txn.id()) {
                return true;
            }
            queue.cv.wait(state);
        }
    }

    /// Release one held lock and wake the queue. Unlocking something not
    /// held aborts the transaction.
    pub fn unlock(&self, txn: &Arc<Transaction>, lock_id: LockDataId) -> Result<bool> {
        if !txn.holds_lock(&lock_id) {
            txn.set_state(TransactionState::Aborted);
            return Err(Error::TransactionAbort(
                txn.id(),
                AbortReason::AttemptedUnlockButNoLockHeld,
            ));
        }
        let queue = self.queue_for(lock_id);
        let mut state = queue.state.lock();
        state.granted.remove(&txn.id());
        queue.cv.notify_all();
        Ok(true)
    }

    /// Start the background detector; idempotent. Called when the first
    /// explicit transaction begins.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        if self.detector_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detector_enabled.store(true, Ordering::SeqCst);
        let this = self.clone();
        std::thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || this.run_cycle_detection())
            .expect("failed to spawn deadlock detector");
        info!("deadlock detection started");
    }

    pub fn stop_deadlock_detection(&self) {
        self.detector_enabled.store(false, Ordering::SeqCst);
    }

    fn run_cycle_detection(&self) {
        while self.detector_enabled.load(Ordering::SeqCst) {
            std::thread::sleep(CYCLE_DETECTION_INTERVAL);

            // Rebuild the wait-for graph: every waiter waits for every
            // granted holder on the same queue.
            let mut waits_for: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
            {
                let table = self.lock_table.lock();
                for queue in table.values() {
                    let state = queue.state.lock();
                    for &holder in state.granted.keys() {
                        for req in &state.waiting {
                            if req.txn_id != holder {
                                waits_for.entry(req.txn_id).or_default().push(holder);
                            }
                        }
                    }
                }
            }
            for edges in waits_for.values_mut() {
                edges.sort_unstable();
                edges.dedup();
            }

            while let Some(victim) = Self::has_cycle(&waits_for) {
                info!("deadlock detected; aborting youngest txn {}", victim);
                if let Some(txn) = self.txns.read().get(&victim).cloned() {
                    txn.set_state(TransactionState::Aborted);
                }
                let queue = self.wait_for_lock_map.lock().get(&victim).cloned();
                if let Some(queue) = queue {
                    queue.cv.notify_all();
                }
                waits_for.remove(&victim);
                for edges in waits_for.values_mut() {
                    edges.retain(|&t| t != victim);
                }
            }
        }
    }

    /// DFS from sources in ascending txn order; on a cycle, the victim is
    /// the largest txn id on the current path (youngest dies).
    fn has_cycle(waits_for: &HashMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
        let mut sources: Vec<TxnId> = waits_for.keys().copied().collect();
        sources.sort_unstable();
        for src in sources {
            let mut on_path = HashSet::new();
            on_path.insert(src);
            if Self::find_cycle(src, waits_for, &mut on_path) {
                return on_path.iter().max().copied();
            }
        }
        None
    }

    fn find_cycle(
        cur: TxnId,
        waits_for: &HashMap<TxnId, Vec<TxnId>>,
        on_path: &mut HashSet<TxnId>,
    ) -> bool {
        if let Some(nexts) = waits_for.get(&cur) {
            for &next in nexts {
                if on_path.contains(&next) {
                    return true;
                }
                on_path.insert(next);
                if Self::find_cycle(next, waits_for, on_path) {
                    return true;
                }
                on_path.remove(&next);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn setup() -> (TxnMap, Arc<LockManager>) {
        let txns: TxnMap = Arc::new(RwLock::new(HashMap::new()));
        let lock_mgr = Arc::new(LockManager::new(txns.clone()));
        (txns, lock_mgr)
    }

    fn make_txn(txns: &TxnMap, id: TxnId) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(id));
        txn.set_explicit(true);
        txns.write().insert(id, txn.clone());
        txn
    }

    #[test]
    fn test_shared_locks_coexist() {
        let (txns, lock_mgr) = setup();
        let t1 = make_txn(&txns, 1);
        let t2 = make_txn(&txns, 2);
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Shared).unwrap());
        assert!(lock_mgr.lock_on_table(&t2, 0, LockMode::Shared).unwrap());
        assert!(t1.holds_lock(&LockDataId::table(0)));
        assert!(t2.holds_lock(&LockDataId::table(0)));
    }

    #[test]
    fn test_relock_fast_path() {
        let (txns, lock_mgr) = setup();
        let t1 = make_txn(&txns, 1);
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Exclusive).unwrap());
        // X already held covers a later S request.
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Shared).unwrap());
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let (txns, lock_mgr) = setup();
        let t1 = make_txn(&txns, 1);
        let t2 = make_txn(&txns, 2);
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Exclusive).unwrap());

        let lm = lock_mgr.clone();
        let t2c = t2.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let granted = lm.lock_on_table(&t2c, 0, LockMode::Shared).unwrap();
            (granted, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(100));
        lock_mgr.unlock(&t1, LockDataId::table(0)).unwrap();
        let (granted, waited) = waiter.join().unwrap();
        assert!(granted);
        assert!(waited >= Duration::from_millis(80));
    }

    #[test]
    fn test_upgrade_shared_to_exclusive() {
        let (txns, lock_mgr) = setup();
        let t1 = make_txn(&txns, 1);
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Shared).unwrap());
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Exclusive).unwrap());
        assert!(t1.holds_lock(&LockDataId::table(0)));
    }

    #[test]
    fn test_unlock_not_held_aborts() {
        let (txns, lock_mgr) = setup();
        let t1 = make_txn(&txns, 1);
        let err = lock_mgr.unlock(&t1, LockDataId::table(9)).unwrap_err();
        assert!(matches!(
            err,
            Error::TransactionAbort(1, AbortReason::AttemptedUnlockButNoLockHeld)
        ));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_deadlock_aborts_youngest() {
        let (txns, lock_mgr) = setup();
        lock_mgr.start_deadlock_detection();
        let t1 = make_txn(&txns, 1);
        let t2 = make_txn(&txns, 2);

        // t1 holds table 0, t2 holds table 1.
        assert!(lock_mgr.lock_on_table(&t1, 0, LockMode::Shared).unwrap());
        assert!(lock_mgr.lock_on_table(&t2, 1, LockMode::Shared).unwrap());

        // Cross requests form a cycle; the detector must abort txn 2.
        let lm = lock_mgr.clone();
        let t1c = t1.clone();
        let h1 = std::thread::spawn(move || lm.lock_on_table(&t1c, 1, LockMode::Exclusive));
        let lm = lock_mgr.clone();
        let t2c = t2.clone();
        let h2 = std::thread::spawn(move || lm.lock_on_table(&t2c, 0, LockMode::Exclusive));

        let r2 = h2.join().unwrap().unwrap();
        assert!(!r2, "youngest transaction on the cycle must be aborted");
        assert_eq!(t2.state(), TransactionState::Aborted);

        // The session rolls the victim back and releases its locks, which
        // unblocks the survivor.
        for lock in t2.lock_set() {
            lock_mgr.unlock(&t2, lock).unwrap();
        }
        let r1 = h1.join().unwrap().unwrap();
        assert!(r1, "older transaction should eventually get its lock");
        lock_mgr.stop_deadlock_detection();
    }
}
