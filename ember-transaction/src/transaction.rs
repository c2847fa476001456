//! Transaction core: shared state, key routing, and argument packing.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use tracing::debug;

use ember_common::error::{EmberError, EmberResult, OpStatus};
use ember_common::ids::{DbIndex, INVALID_TXID, ShardId, TxId};
use ember_common::sync::EventCount;
use ember_core::command::{CommandFrame, CommandSpec, KeyIndex, opt};
use ember_shard::intent_lock::LockMode;
use ember_shard::{EngineShard, KeyLockArgs, ShardArgs, ShardSet, TxQueue};

/// Per-shard slot flags, owned by the shard thread while a hop runs there.
pub(crate) mod local_mask {
    /// The slot has a pending hop to run.
    pub const ARMED: u16 = 1;
    /// The slot may execute ahead of its queue position.
    pub const OUT_OF_ORDER: u16 = 1 << 1;
    /// The slot holds per-key intent locks.
    pub const KEYLOCK_ACQUIRED: u16 = 1 << 2;
    /// The slot is parked on this shard's watch tables.
    pub const SUSPENDED_Q: u16 = 1 << 3;
    /// A writer woke the slot; the wake has not been consumed yet.
    pub const AWAKED_Q: u16 = 1 << 4;
    /// The blocking wait expired on this shard.
    pub const EXPIRED_Q: u16 = 1 << 5;
}

/// Coordinator-side state flags.
pub(crate) mod coord {
    /// Scheduling succeeded; a txid and queue positions exist.
    pub const SCHED: u8 = 1;
    /// Every touched shard granted its locks on the first attempt.
    pub const OOO: u8 = 1 << 1;
    /// A hop is executing.
    pub const EXEC: u8 = 1 << 2;
    /// The executing hop concludes the transaction.
    pub const EXEC_CONCLUDING: u8 = 1 << 3;
    /// The coordinator is parked on the blocking condition variable.
    pub const BLOCKED: u8 = 1 << 4;
    /// The owner connection went away while blocked.
    pub const CANCELLED: u8 = 1 << 5;
}

/// Process-wide monotonic transaction id source.
static OP_SEQ: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_txid() -> TxId {
    OP_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Shard callback run by [`Transaction::execute`] and friends.
pub type RunnableCallback = Arc<dyn Fn(&Transaction, &mut EngineShard) -> OpStatus + Send + Sync>;

/// One shard's view of the transaction.
///
/// The fields are atomics not for lock-free cleverness but because exactly
/// one shard thread writes them during a hop while the coordinator reads
/// them outside of it; the hop barrier and the dispatch channel provide the
/// ordering, so all accesses are relaxed.
#[derive(Debug)]
pub(crate) struct ShardSlot {
    /// First index of this shard's window into the packed argument array.
    /// `-1` marks the single-shard layout where the window is the whole
    /// array.
    pub arg_start: AtomicI32,
    pub arg_count: AtomicI32,
    /// Queue position on the owning shard, [`TxQueue::END`] when absent.
    pub pq_pos: AtomicU32,
    pub local_mask: AtomicU16,
}

impl ShardSlot {
    fn new() -> Self {
        Self {
            arg_start: AtomicI32::new(0),
            arg_count: AtomicI32::new(0),
            pq_pos: AtomicU32::new(TxQueue::END),
            local_mask: AtomicU16::new(0),
        }
    }

    pub(crate) fn mask(&self) -> u16 {
        self.local_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn set_mask(&self, bits: u16) {
        let _ = self.local_mask.fetch_or(bits, Ordering::Relaxed);
    }

    pub(crate) fn clear_mask(&self, bits: u16) {
        let _ = self.local_mask.fetch_and(!bits, Ordering::Relaxed);
    }
}

/// Routing output of [`Transaction::init_by_args`], immutable while a hop is
/// in flight.
#[derive(Debug)]
pub(crate) struct RoutingState {
    pub db_index: DbIndex,
    /// Arguments sorted by destination shard.
    pub args: Arc<Vec<Vec<u8>>>,
    /// `reverse_index[i]` is the caller-side position of `args[i]`.
    pub reverse_index: Vec<u32>,
    pub unique_shard_cnt: u32,
    pub unique_shard_id: ShardId,
}

impl RoutingState {
    fn new() -> Self {
        Self {
            db_index: 0,
            args: Arc::new(Vec::new()),
            reverse_index: Vec::new(),
            unique_shard_cnt: 0,
            unique_shard_id: 0,
        }
    }
}

/// Shared/exclusive hold counts accumulated for one key of a multi
/// transaction.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LockCnt {
    pub cnt: [u32; 2],
}

/// State carried only by multi transactions (explicit batches and scripts).
#[derive(Debug)]
pub(crate) struct MultiData {
    /// Option mask of the enclosing multi command, kept for unlock even
    /// after `set_exec_cmd` swaps the descriptor.
    pub multi_opts: u32,
    /// Batches record locks statement by statement; scripts record the whole
    /// set up front.
    pub incremental: bool,
    pub locks_recorded: bool,
    /// Union of every recorded key with its accumulated hold counts.
    pub locks: hashbrown::HashMap<Vec<u8>, LockCnt>,
}

/// A single user-visible operation executing atomically across the shards
/// that own its keys.
pub struct Transaction {
    weak_self: Weak<Transaction>,
    cid: RwLock<&'static CommandSpec>,
    shard_set: Arc<ShardSet>,

    txid: AtomicU64,
    routing: RwLock<RoutingState>,
    slots: RwLock<Vec<ShardSlot>>,
    multi: Option<Mutex<MultiData>>,

    coordinator_state: AtomicU8,
    /// Hop-completion barrier: number of armed shards that have not finished
    /// the current hop.
    run_count: AtomicU32,
    /// Generation guard for in-flight shard dispatches; a dispatch that
    /// observes a different generation must not act on the transaction.
    seqlock: AtomicU32,
    /// Earliest waker's txid, [`INVALID_TXID`] while nobody woke us.
    pub(crate) notify_txid: AtomicU64,

    local_result: Mutex<OpStatus>,
    cb: RwLock<Option<RunnableCallback>>,

    run_ec: EventCount,
    pub(crate) blocking_ec: EventCount,
}

impl Transaction {
    /// Creates a transaction for one command descriptor.
    ///
    /// Multi descriptors (batches and scripts) allocate the lock-recording
    /// state here; everything else stays single-command.
    #[must_use]
    pub fn new(cid: &'static CommandSpec, shard_set: Arc<ShardSet>) -> Arc<Self> {
        let multi = if cid.has_opt(opt::MULTI_BATCH) || cid.has_opt(opt::MULTI_SCRIPT) {
            Some(Mutex::new(MultiData {
                multi_opts: cid.opt_mask,
                incremental: cid.has_opt(opt::MULTI_BATCH),
                locks_recorded: false,
                locks: hashbrown::HashMap::new(),
            }))
        } else {
            None
        };

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            cid: RwLock::new(cid),
            shard_set,
            txid: AtomicU64::new(0),
            routing: RwLock::new(RoutingState::new()),
            slots: RwLock::new(Vec::new()),
            multi,
            coordinator_state: AtomicU8::new(0),
            run_count: AtomicU32::new(0),
            seqlock: AtomicU32::new(0),
            notify_txid: AtomicU64::new(INVALID_TXID),
            local_result: Mutex::new(OpStatus::Ok),
            cb: RwLock::new(None),
            run_ec: EventCount::new(),
            blocking_ec: EventCount::new(),
        })
    }

    /// Routes the command's keys and packs the per-shard argument windows.
    ///
    /// Multi transactions may call this repeatedly (once per statement); the
    /// routing state is rebuilt each time while the recorded lock union
    /// keeps accumulating until the transaction is scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error when the arguments do not match the command's
    /// declared key shape.
    pub fn init_by_args(&self, db_index: DbIndex, frame: &CommandFrame) -> EmberResult<()> {
        let cid = *self.read_cid();
        let shard_count = usize::from(self.shard_set.size());
        let mut routing = self.write_routing();
        let mut slots = self.write_slots();

        routing.db_index = db_index;
        if self.multi.is_some() {
            routing.args = Arc::new(Vec::new());
            routing.reverse_index.clear();
            routing.unique_shard_cnt = 0;
        } else {
            debug_assert_eq!(routing.unique_shard_cnt, 0, "non-multi re-initialization");
            debug_assert!(routing.args.is_empty());
        }

        if self.is_global() {
            routing.unique_shard_cnt = u32::try_from(shard_count).expect("shard count fits u32");
            Self::ensure_slots(&mut slots, shard_count);
            return Ok(());
        }

        let key_index = KeyIndex::determine(&cid, &frame.args)?;
        if key_index.is_empty() {
            // Zero-key scripted command: no shard selection at all.
            return Ok(());
        }

        let multi_guard = self.multi.as_ref().map(|multi| {
            multi
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
        });
        let single_key = multi_guard.is_none() && key_index.is_single_key();

        if single_key {
            let args = frame.args[key_index.start..key_index.start + key_index.step].to_vec();
            routing.unique_shard_id = self.shard_set.resolver().shard_for_key(&args[0]);
            routing.unique_shard_cnt = 1;
            routing.args = Arc::new(args);
            routing.reverse_index.clear();
            Self::ensure_slots(&mut slots, 1);
            return Ok(());
        }

        Self::ensure_slots(&mut slots, shard_count);
        debug_assert!(key_index.step == 1 || key_index.step == 2);

        // Incremental batches record (and later acquire) their keys once
        // per statement; lock-ahead scripts record the whole set on the
        // first pass only.
        let mut multi_guard = multi_guard;
        let record_mode = self.mode();
        let incremental_locking = multi_guard.as_ref().is_some_and(|multi| multi.incremental);
        let should_record_locks = multi_guard
            .as_ref()
            .is_some_and(|multi| multi.incremental || !multi.locks_recorded);
        let mut uniq_keys = hashbrown::HashSet::new();

        let mut buckets: Vec<(Vec<Vec<u8>>, Vec<u32>)> = Vec::new();
        buckets.resize_with(shard_count, Default::default);

        let mut position = key_index.start;
        while position < key_index.end {
            let key = &frame.args[position];
            let sid = usize::from(self.shard_set.resolver().shard_for_key(key));
            buckets[sid].0.push(key.clone());
            buckets[sid].1.push(u32::try_from(position).expect("arg index fits u32"));

            if should_record_locks
                && let Some(multi) = multi_guard.as_mut()
                && uniq_keys.insert(key.clone())
            {
                multi.locks.entry(key.clone()).or_default().cnt[record_mode.index()] += 1;
            }

            if key_index.step == 2 {
                let value = &frame.args[position + 1];
                buckets[sid].0.push(value.clone());
                buckets[sid]
                    .1
                    .push(u32::try_from(position + 1).expect("arg index fits u32"));
            }
            position += key_index.step;
        }

        if let Some(multi) = multi_guard.as_mut() {
            multi.locks_recorded = true;
        }
        drop(multi_guard);

        let mut packed = Vec::with_capacity(key_index.end - key_index.start);
        routing.reverse_index.clear();
        for (sid, (bucket_args, bucket_origins)) in buckets.into_iter().enumerate() {
            let slot = &slots[sid];
            slot.arg_start
                .store(i32::try_from(packed.len()).expect("arg offset fits i32"), Ordering::Relaxed);
            slot.arg_count.store(
                i32::try_from(bucket_args.len()).expect("arg count fits i32"),
                Ordering::Relaxed,
            );
            if incremental_locking {
                // Each statement of an incremental batch locks its own keys,
                // so the keylock bookkeeping starts clean; lock-ahead multis
                // keep their masks to avoid double locking.
                slot.local_mask.store(0, Ordering::Relaxed);
            }
            if bucket_args.is_empty() {
                continue;
            }
            routing.unique_shard_cnt += 1;
            routing.unique_shard_id = ShardId::try_from(sid).expect("shard id fits u16");
            packed.extend(bucket_args);
            routing.reverse_index.extend(bucket_origins);
        }
        routing.args = Arc::new(packed);

        if routing.unique_shard_cnt == 1 {
            // Single-shard layout: the whole argument array belongs to one
            // shard, marked by the sentinel window.
            let sentinel_index = if self.multi.is_some() {
                usize::from(routing.unique_shard_id)
            } else {
                Self::ensure_slots(&mut slots, 1);
                0
            };
            let slot = &slots[sentinel_index];
            slot.arg_start.store(-1, Ordering::Relaxed);
            slot.arg_count.store(-1, Ordering::Relaxed);
        }

        for slot in slots.iter() {
            debug_assert_eq!(slot.mask() & local_mask::ARMED, 0);
            if self.multi.is_none() {
                debug_assert_eq!(slot.pq_pos.load(Ordering::Relaxed), TxQueue::END);
            }
        }
        debug!(
            name = self.name(),
            shards = routing.unique_shard_cnt,
            "routed arguments"
        );
        Ok(())
    }

    fn ensure_slots(slots: &mut Vec<ShardSlot>, len: usize) {
        if slots.len() != len {
            slots.clear();
            slots.resize_with(len, ShardSlot::new);
        }
    }

    /// Intent-lock mode derived from the command's option flags.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        if self.read_cid().has_opt(opt::READONLY) {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    /// Whether this transaction takes whole-shard locks on every shard.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.read_cid().has_opt(opt::GLOBAL_TRANS)
    }

    /// Whether scheduling granted out-of-order execution.
    #[must_use]
    pub fn is_ooo(&self) -> bool {
        self.coordinator_state.load(Ordering::Relaxed) & coord::OOO != 0
    }

    /// Command name of the current descriptor.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.read_cid().name
    }

    /// Logical database this transaction operates on.
    #[must_use]
    pub fn db_index(&self) -> DbIndex {
        self.read_routing().db_index
    }

    /// Scheduled transaction id; zero while unscheduled (including eager
    /// single-shard runs, which never take one).
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid.load(Ordering::Relaxed)
    }

    /// Number of shards holding this transaction's keys.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> u32 {
        self.read_routing().unique_shard_cnt
    }

    /// Diagnostic identity: `NAME@txid/shard_cnt`.
    #[must_use]
    pub fn debug_id(&self) -> String {
        format!(
            "{}@{}/{}",
            self.name(),
            self.txid.load(Ordering::Relaxed),
            self.read_routing().unique_shard_cnt,
        )
    }

    /// This shard's window into the packed argument array.
    #[must_use]
    pub fn shard_args_in_shard(&self, sid: ShardId) -> ShardArgs {
        let routing = self.read_routing();
        if routing.unique_shard_cnt == 1 {
            return ShardArgs::whole(Arc::clone(&routing.args));
        }
        let slots = self.read_slots();
        let slot = &slots[usize::from(sid)];
        let start = slot.arg_start.load(Ordering::Relaxed);
        let count = slot.arg_count.load(Ordering::Relaxed);
        debug_assert!(start >= 0 && count >= 0, "shard has no argument window");
        ShardArgs::new(
            Arc::clone(&routing.args),
            usize::try_from(start).unwrap_or_default(),
            usize::try_from(count).unwrap_or_default(),
        )
    }

    /// Maps a position inside a shard's window back to the caller's
    /// argument index.
    #[must_use]
    pub fn reverse_arg_index(&self, sid: ShardId, arg_index: usize) -> usize {
        let routing = self.read_routing();
        if routing.unique_shard_cnt == 1 {
            return arg_index;
        }
        let slots = self.read_slots();
        let start = slots[usize::from(sid)].arg_start.load(Ordering::Relaxed);
        let start = usize::try_from(start).expect("multi-shard windows have real offsets");
        routing.reverse_index[start + arg_index] as usize
    }

    /// Lock-table addressing for this shard's keys.
    pub(crate) fn get_lock_args(&self, sid: ShardId) -> KeyLockArgs {
        KeyLockArgs {
            db_index: self.read_routing().db_index,
            key_step: usize::from(self.read_cid().key_arg_step()),
            args: self.shard_args_in_shard(sid),
        }
    }

    // ---- internal plumbing shared by the scheduling/execution/blocking
    // ---- modules.

    pub(crate) fn self_arc(&self) -> Arc<Transaction> {
        self.weak_self
            .upgrade()
            .expect("transaction outlives its own method calls")
    }

    pub(crate) fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shard_set
    }

    pub(crate) fn read_cid(&self) -> RwLockReadGuard<'_, &'static CommandSpec> {
        self.cid.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_cid(&self) -> RwLockWriteGuard<'_, &'static CommandSpec> {
        self.cid.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_routing(&self) -> RwLockReadGuard<'_, RoutingState> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_routing(&self) -> RwLockWriteGuard<'_, RoutingState> {
        self.routing.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_slots(&self) -> RwLockReadGuard<'_, Vec<ShardSlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<ShardSlot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn multi_data(&self) -> Option<MutexGuard<'_, MultiData>> {
        self.multi
            .as_ref()
            .map(|multi| multi.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn is_multi(&self) -> bool {
        self.multi.is_some()
    }

    pub(crate) fn read_cb(&self) -> Option<RunnableCallback> {
        self.cb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn install_cb(&self, cb: Option<RunnableCallback>) {
        *self.cb.write().unwrap_or_else(PoisonError::into_inner) = cb;
    }

    pub(crate) fn store_local_result(&self, status: OpStatus) {
        *self
            .local_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub(crate) fn local_result(&self) -> OpStatus {
        *self
            .local_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn txid_relaxed(&self) -> TxId {
        self.txid.load(Ordering::Relaxed)
    }

    pub(crate) fn store_txid(&self, txid: TxId) {
        self.txid.store(txid, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> u8 {
        self.coordinator_state.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, bits: u8) {
        let _ = self.coordinator_state.fetch_or(bits, Ordering::Relaxed);
    }

    pub(crate) fn clear_state(&self, bits: u8) {
        let _ = self.coordinator_state.fetch_and(!bits, Ordering::Relaxed);
    }

    /// Maps a shard id onto the slot array (which has length 1 for the
    /// single-shard layout).
    pub(crate) fn slot_index(slots: &[ShardSlot], sid: ShardId) -> usize {
        if slots.len() == 1 { 0 } else { usize::from(sid) }
    }

    pub(crate) fn slot_mask(&self, sid: ShardId) -> u16 {
        let slots = self.read_slots();
        slots[Self::slot_index(&slots, sid)].mask()
    }

    pub(crate) fn seqlock_value(&self) -> u32 {
        self.seqlock.load(Ordering::Relaxed)
    }

    /// Release-RMW read used by shard dispatches to order the generation
    /// check after their `local_mask` load.
    pub(crate) fn seqlock_fenced(&self) -> u32 {
        self.seqlock.fetch_add(0, Ordering::Release)
    }

    /// Invalidates every dispatch snapshot taken before this call.
    pub(crate) fn bump_seqlock(&self) {
        let _ = self.seqlock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn run_count_relaxed(&self) -> u32 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub(crate) fn run_count_acquire(&self) -> u32 {
        self.run_count.load(Ordering::Acquire)
    }

    /// Publishes the hop's shard count; release-ordered after the arming
    /// writes so shard threads that observe it also observe their armed
    /// slot.
    pub(crate) fn publish_run_count(&self, count: u32) {
        self.run_count.store(count, Ordering::Release);
    }

    pub(crate) fn add_run_count(&self, count: u32) -> u32 {
        self.run_count.fetch_add(count, Ordering::Release)
    }

    /// Completes this shard's share of the hop; the last decrement wakes
    /// the coordinator.
    pub(crate) fn decrease_run_cnt(&self) -> u32 {
        let previous = self.run_count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous >= 1, "run count underflow");
        if previous == 1 {
            self.run_ec.notify();
        }
        previous
    }

    /// Parks the coordinator until every armed shard finished the hop.
    pub(crate) fn wait_for_shard_callbacks(&self) {
        self.run_ec
            .wait_until(|| self.run_count.load(Ordering::Acquire) == 0);
    }

    /// Shards participating in the current hop.
    pub(crate) fn active_shards(&self) -> Vec<ShardId> {
        if self.is_global() {
            return self.shard_set.shard_ids().collect();
        }
        let routing = self.read_routing();
        if routing.unique_shard_cnt == 1 {
            return vec![routing.unique_shard_id];
        }
        let slots = self.read_slots();
        self.shard_set
            .shard_ids()
            .filter(|sid| slots[usize::from(*sid)].arg_count.load(Ordering::Relaxed) > 0)
            .collect()
    }

    /// Upcasts a transaction handle to the shard engine's trait object.
    pub(crate) fn queued_handle(this: &Arc<Self>) -> Arc<dyn ember_shard::QueuedTransaction> {
        Arc::clone(this) as Arc<dyn ember_shard::QueuedTransaction>
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name())
            .field("txid", &self.txid.load(Ordering::Relaxed))
            .field("state", &self.coordinator_state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        debug!(id = %self.debug_id(), "transaction destroyed");
    }
}

/// Guards against misuse of the multi-only entry points.
pub(crate) fn require_multi(transaction: &Transaction) -> EmberResult<()> {
    if transaction.is_multi() {
        Ok(())
    } else {
        Err(EmberError::InvalidState(
            "operation requires a multi transaction",
        ))
    }
}
