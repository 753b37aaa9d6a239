//! Cache Store Module
//!
//! The cache engine. Entries hang off a chained hash index that lives in the
//! shared arena together with everything else, so any process attached to
//! the arena sees the same cache. Chains are guarded by lock shards
//! (`bucket % shard_count`); reference counts are the only entry fields
//! touched without the owning shard's write lock.
//!
//! Lock order: shard locks in ascending index, then a shard's slam lock,
//! then the GC lock, then segment locks inside the allocator.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::cache::clock::{current_timestamp_ms, Clock, SystemClock};
use crate::cache::entry::{EntryHandle, EntryHeader, EntryLayout, EntryState};
use crate::cache::serializer::{Serializer, SerializerRegistry};
use crate::cache::slam::{SlamQuery, SlamTable};
use crate::cache::stats::{CacheStats, SharedStats};
use crate::cache::updater::UpdateOp;
use crate::cache::value::{self, Encoded, Value, ValueTag};
use crate::cache::MAX_KEY_LENGTH;
use crate::config::{Config, MAX_LOCK_SHARDS};
use crate::error::{CacheError, Result};
use crate::shm::{
    Arena, ArenaOptions, HeapMemory, Pool, PoolHandle, PoolKind, SharedLock, ShmRwLock,
    ShmWriteGuard, SmaInfo,
};

/// "SHMSTORE" in ASCII.
const CACHE_MAGIC: u64 = 0x5348_4D53_544F_5245;
const MIN_BUCKETS: usize = 16;

// == Shared Layout ==
#[repr(C)]
pub(crate) struct Shard {
    lock: ShmRwLock,
    slam_lock: ShmRwLock,
    pub slam: SlamTable,
}

/// Engine state in the arena's control area.
#[repr(C)]
pub(crate) struct CacheHeader {
    magic: u64,
    pub bucket_count: u64,
    buckets: u64,
    pub shard_count: u32,
    gc_lock: ShmRwLock,
    /// Head of the deferred-free list
    pub gc_head: AtomicU64,
    /// Next bucket the sweeper visits
    pub gc_cursor: AtomicU64,
    next_generation: AtomicU64,
    pub stats: SharedStats,
    shards: [Shard; MAX_LOCK_SHARDS as usize],
}

impl CacheHeader {
    fn new(bucket_count: u64, buckets: u64, shard_count: u32, now: u64) -> Self {
        Self {
            magic: CACHE_MAGIC,
            bucket_count,
            buckets,
            shard_count,
            gc_lock: ShmRwLock::new(),
            gc_head: AtomicU64::new(0),
            gc_cursor: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            stats: SharedStats::new(now),
            shards: std::array::from_fn(|_| Shard {
                lock: ShmRwLock::new(),
                slam_lock: ShmRwLock::new(),
                slam: SlamTable::new(),
            }),
        }
    }
}

// == Lock Handles ==
/// This process's handles on the locks in a [`CacheHeader`].
#[derive(Debug)]
pub(crate) struct StoreLocks {
    shards: Vec<SharedLock>,
    slams: Vec<SharedLock>,
    pub gc: SharedLock,
}

impl StoreLocks {
    /// Initializes the header's locks in place, or reopens them when
    /// `fresh` is false.
    fn new(header: &CacheHeader, fresh: bool, timeout: Duration) -> Result<Self> {
        let open: fn(&ShmRwLock, &'static str, Duration) -> Result<SharedLock> = if fresh {
            SharedLock::create
        } else {
            SharedLock::open
        };
        let shards = &header.shards[..header.shard_count as usize];
        Ok(Self {
            shards: shards
                .iter()
                .map(|shard| open(&shard.lock, "shard", timeout))
                .collect::<Result<_>>()?,
            slams: shards
                .iter()
                .map(|shard| open(&shard.slam_lock, "slam", timeout))
                .collect::<Result<_>>()?,
            gc: open(&header.gc_lock, "gc", timeout)?,
        })
    }
}

// == Cache Store ==
/// Handle on a shared cache.
///
/// Cloning is cheap and clones share the same owner token, so they count as
/// one participant for slam defense. Every process (or independent worker)
/// should build its own handle with [`CacheStore::attach`].
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
    /// Frozen time for the current request, when enabled
    request_time: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    /// Declared before the arena so the handles go first.
    locks: Arc<StoreLocks>,
    arena: Arc<Arena>,
    config: Config,
    clock: Arc<dyn Clock>,
    serializers: Arc<SerializerRegistry>,
    serializer: OnceCell<Arc<dyn Serializer>>,
    owner: u64,
}

impl CacheStore {
    // == Constructors ==
    /// Arena geometry for a configuration.
    pub fn arena_options(config: &Config) -> ArenaOptions {
        ArenaOptions {
            size: config.shm_size,
            segments: config.shm_segments,
            control_bytes: size_of::<CacheHeader>(),
            protect: config.protect_memory,
        }
    }

    /// Formats a freshly created arena and publishes it to attachers.
    pub fn create(arena: Arc<Arena>, config: &Config) -> Result<Self> {
        if arena.control_size() < size_of::<CacheHeader>() {
            return Err(CacheError::InvalidArena(format!(
                "control area of {} bytes cannot hold the cache header",
                arena.control_size()
            )));
        }
        let bucket_count = config.entries_hint.max(MIN_BUCKETS).next_power_of_two();
        let shard_count = config.lock_shards.clamp(1, MAX_LOCK_SHARDS);
        let bucket_bytes = bucket_count * size_of::<AtomicU64>();
        let buckets = arena.alloc(bucket_bytes)?;
        {
            let _writable = arena.unprotected();
            // SAFETY: both regions were just reserved for us and nobody else
            // can reach them before mark_ready.
            unsafe {
                std::ptr::write_bytes(arena.ptr(buckets), 0, bucket_bytes);
                std::ptr::write(
                    arena.control_ptr() as *mut CacheHeader,
                    CacheHeader::new(
                        bucket_count as u64,
                        buckets,
                        shard_count,
                        current_timestamp_ms(),
                    ),
                );
            }
        }
        let locks = StoreLocks::new(
            // SAFETY: written just above.
            unsafe { &*(arena.control_ptr() as *const CacheHeader) },
            true,
            Duration::from_millis(config.lock_timeout_ms),
        )?;
        arena.mark_ready();
        info!(
            "Cache initialized: {} buckets, {} lock shards, {} bytes available",
            bucket_count,
            shard_count,
            arena.avail()
        );
        Ok(Self::handle(arena, locks, config))
    }

    /// Joins a cache another handle or process already created.
    pub fn attach(arena: Arc<Arena>, config: &Config) -> Result<Self> {
        if !arena.is_ready() {
            return Err(CacheError::InvalidArena("arena is not initialized".into()));
        }
        if arena.control_size() < size_of::<CacheHeader>() {
            return Err(CacheError::InvalidArena("control area too small".into()));
        }
        // SAFETY: the control area is large enough and the arena is ready.
        let header = unsafe { &*(arena.control_ptr() as *const CacheHeader) };
        if header.magic != CACHE_MAGIC {
            return Err(CacheError::InvalidArena("no cache in this arena".into()));
        }
        let locks = StoreLocks::new(
            header,
            false,
            Duration::from_millis(config.lock_timeout_ms),
        )?;
        debug!(
            "Attached cache handle: {} buckets, {} lock shards",
            header.bucket_count, header.shard_count
        );
        Ok(Self::handle(arena, locks, config))
    }

    /// Creates the named arena from `config`, or joins it if it exists.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let arena = Arena::open_or_create(&config.shm_name, &Self::arena_options(config))?;
        let arena = Arc::new(arena);
        if arena.is_owner() {
            Self::create(arena, config)
        } else {
            Self::attach(arena, config)
        }
    }

    /// A cache on an anonymous arena, shareable through its descriptor.
    pub fn in_memory(config: &Config) -> Result<Self> {
        let arena = Arena::anonymous(&Self::arena_options(config))?;
        Self::create(Arc::new(arena), config)
    }

    /// Same cache and owner token, different time source.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        let inner = Inner {
            locks: self.inner.locks.clone(),
            arena: self.inner.arena.clone(),
            config: self.inner.config.clone(),
            clock,
            serializers: self.inner.serializers.clone(),
            serializer: OnceCell::new(),
            owner: self.inner.owner,
        };
        Self {
            inner: Arc::new(inner),
            request_time: None,
        }
    }

    fn handle(arena: Arc<Arena>, locks: StoreLocks, config: &Config) -> Self {
        let owner = arena.next_token();
        Self {
            inner: Arc::new(Inner {
                locks: Arc::new(locks),
                arena,
                config: config.clone(),
                clock: Arc::new(SystemClock),
                serializers: Arc::new(SerializerRegistry::new()),
                serializer: OnceCell::new(),
                owner,
            }),
            request_time: None,
        }
    }

    // == Time ==
    /// Time used for TTL accounting, in Unix milliseconds.
    pub fn now(&self) -> u64 {
        self.request_time
            .unwrap_or_else(|| self.inner.clock.now_ms())
    }

    /// A handle whose clock stays at the request's start time, when
    /// `use_request_time` is enabled.
    pub fn begin_request(&self) -> CacheStore {
        Self {
            inner: self.inner.clone(),
            request_time: self
                .inner
                .config
                .use_request_time
                .then(|| self.inner.clock.now_ms()),
        }
    }

    // == Store / Add ==
    /// Stores a value, replacing any existing entry for `key`.
    ///
    /// A ttl of 0 means the configured default TTL.
    pub fn store(&self, key: &str, value: &Value, ttl: u32) -> Result<()> {
        self.insert(key, value, ttl, false)
    }

    /// Stores a value only if no live entry exists for `key`.
    pub fn add(&self, key: &str, value: &Value, ttl: u32) -> Result<()> {
        self.insert(key, value, ttl, true)
    }

    /// Stores every pair and returns the keys that were not stored.
    pub fn store_many(&self, entries: &[(String, Value)], ttl: u32) -> Vec<String> {
        entries
            .iter()
            .filter(|(key, value)| self.store(key, value, ttl).is_err())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Adds every pair and returns the keys that were not added.
    pub fn add_many(&self, entries: &[(String, Value)], ttl: u32) -> Vec<String> {
        entries
            .iter()
            .filter(|(key, value)| self.add(key, value, ttl).is_err())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn insert(&self, key: &str, value: &Value, ttl: u32, exclusive: bool) -> Result<()> {
        validate_key(key)?;
        let now = self.now();
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);
        let query = self.slam_query(hash, key, now);

        if let Some(query) = &query {
            let (table, lock) = self.slam_of(bucket);
            if table.is_guarded(lock, query) {
                return Err(self.slam_rejected(key));
            }
        }

        let ttl = if ttl == 0 { self.inner.config.default_ttl } else { ttl };
        let encoded = value::encode(value, || self.serializer())?;
        let (pool, offset) = match self.prepare(key, hash, &encoded, ttl, now) {
            Ok(prepared) => prepared,
            Err(CacheError::AllocationFailure { .. }) => {
                self.expunge(now);
                self.prepare(key, hash, &encoded, ttl, now)
                    .map_err(|e| self.allocation_failed(key, e))?
            }
            Err(e) => return Err(e),
        };

        {
            let _lock = self.shard_lock(bucket).write();
            let _writable = self.arena().unprotected();

            if let Some(query) = &query {
                let (table, lock) = self.slam_of(bucket);
                if !table.admit(lock, query) {
                    return Err(self.slam_rejected(key));
                }
            }
            if let Some(existing) = self.lookup(bucket, hash, key) {
                if exclusive && !self.entry(existing).is_expired(now) {
                    return Err(CacheError::ExclusivityConflict(key.to_string()));
                }
            }
            self.unlink_where(bucket, now, |e| {
                e.is_expired(now) || self.matches(e, hash, key)
            });

            let committed = pool.commit();
            let head = self.bucket(bucket);
            self.entry(offset)
                .next
                .store(head.load(Ordering::Acquire), Ordering::Release);
            head.store(offset, Ordering::Release);

            let stats = &self.header().stats;
            SharedStats::bump(&stats.inserts);
            SharedStats::bump(&stats.num_entries);
            stats.mem_size.fetch_add(committed.size, Ordering::Relaxed);
        }

        self.gc_step(now);
        Ok(())
    }

    /// Materializes an entry in its own arena pool. Nothing is visible to
    /// other callers until the pool is committed and linked.
    fn prepare(
        &self,
        key: &str,
        hash: u64,
        encoded: &Encoded,
        ttl: u32,
        now: u64,
    ) -> Result<(Pool<&Arena>, u64)> {
        let needed =
            align8(size_of::<EntryHeader>()) + align8(key.len()) + align8(encoded.bytes.len());
        let mut pool = Pool::create(self.arena(), PoolKind::fitting(needed));
        let offset = pool.alloc(size_of::<EntryHeader>())?;
        let key_off = pool.copy_in(key.as_bytes())?;
        let value_off = pool.copy_in(&encoded.bytes)?;

        let header = EntryHeader::new(EntryLayout {
            hash,
            generation: self.header().next_generation.fetch_add(1, Ordering::SeqCst),
            key_off,
            key_len: key.len(),
            value_off,
            value_len: encoded.bytes.len(),
            value_tag: encoded.tag,
            pool_head: pool.head(),
            mem_size: pool.size() as u64,
            ttl,
            now,
        });
        // SAFETY: offset came from this pool's allocation sized for a header.
        unsafe { std::ptr::write(pool.ptr(offset) as *mut EntryHeader, header) };
        Ok((pool, offset))
    }

    // == Find / Fetch ==
    /// Looks up a live entry and takes a reference on it.
    ///
    /// The reference is released when the returned guard drops. An expired
    /// entry counts as a miss and is unlinked on the way out.
    pub fn find(&self, key: &str) -> Result<EntryGuard<'_>> {
        validate_key(key)?;
        let now = self.now();
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);
        let stats = &self.header().stats;

        let mut expired = false;
        let found = {
            let _read;
            let _write;
            let lock = self.shard_lock(bucket);
            if self.inner.config.write_lock {
                _write = lock.write();
            } else {
                _read = lock.read();
            }
            let found = match self.lookup(bucket, hash, key) {
                Some(offset) if self.entry(offset).is_expired(now) => {
                    expired = true;
                    None
                }
                Some(offset) => Some(self.acquire(offset, now)),
                None => None,
            };
            if found.is_none() {
                if let Some(query) = self.slam_query(hash, key, now) {
                    let (table, lock) = self.slam_of(bucket);
                    table.note_miss(lock, &query);
                }
            }
            found
        };

        match found {
            Some(handle) => {
                SharedStats::bump(&stats.hits);
                Ok(EntryGuard {
                    store: self,
                    handle,
                })
            }
            None => {
                SharedStats::bump(&stats.misses);
                if expired {
                    self.reap(bucket, hash, key, now);
                }
                Err(CacheError::KeyNotFound(key.to_string()))
            }
        }
    }

    /// Copies a value out of the cache.
    pub fn fetch(&self, key: &str) -> Result<Value> {
        self.find(key)?.value()
    }

    /// Fetches every key and returns the ones that were found.
    pub fn fetch_many<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.fetch(key).ok().map(|value| (key.to_string(), value))
            })
            .collect()
    }

    // == Exists ==
    /// True if a live entry exists. Takes no reference and counts nothing.
    pub fn exists(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        let now = self.now();
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);
        let _lock = self.shard_lock(bucket).read();
        self.lookup(bucket, hash, key)
            .is_some_and(|offset| !self.entry(offset).is_expired(now))
    }

    /// Returns the keys that exist.
    pub fn exists_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        keys.iter()
            .map(AsRef::as_ref)
            .filter(|key| self.exists(key))
            .map(str::to_string)
            .collect()
    }

    // == Delete ==
    /// Removes `key` from the index. Its storage is freed once the last
    /// reader lets go.
    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let now = self.now();
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);

        let _lock = self.shard_lock(bucket).write();
        let _writable = self.arena().unprotected();
        let offset = self
            .lookup(bucket, hash, key)
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()))?;
        let expired = self.entry(offset).is_expired(now);
        self.unlink_where(bucket, now, |e| self.matches(e, hash, key));
        if expired {
            return Err(CacheError::KeyNotFound(key.to_string()));
        }
        SharedStats::bump(&self.header().stats.deletes);
        Ok(())
    }

    /// Deletes every key and returns the ones that could not be deleted.
    pub fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        keys.iter()
            .map(AsRef::as_ref)
            .filter(|key| self.delete(key).is_err())
            .map(str::to_string)
            .collect()
    }

    // == Atomic Updates ==
    /// Applies `op` to the integer stored under `key`, in place.
    ///
    /// Fails with `KeyNotFound` for an absent or expired key and with
    /// `TypeMismatch` if the value is not an integer or a compare-and-swap
    /// expectation does not hold. A failed update changes nothing.
    pub fn update(&self, key: &str, op: UpdateOp) -> Result<i64> {
        validate_key(key)?;
        let now = self.now();
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);

        let _lock = self.shard_lock(bucket).write();
        let _writable = self.arena().unprotected();
        let offset = self
            .lookup(bucket, hash, key)
            .filter(|offset| !self.entry(*offset).is_expired(now))
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()))?;
        let entry = self.entry(offset);
        if entry.value_tag() != Some(ValueTag::Long) {
            return Err(CacheError::TypeMismatch(format!(
                "{}: {} needs an integer value",
                key,
                op.name()
            )));
        }
        // SAFETY: Long payloads are 8 byte, 8 aligned i64 cells.
        let cell: &AtomicI64 = unsafe { self.arena().at(entry.value_off) };
        let result = op.apply(key, cell)?;
        entry.modified_at.store(now, Ordering::Relaxed);
        Ok(result)
    }

    /// Adds `step` and returns the new value.
    pub fn inc(&self, key: &str, step: i64) -> Result<i64> {
        self.update(key, UpdateOp::Increment(step))
    }

    /// Subtracts `step` and returns the new value.
    pub fn dec(&self, key: &str, step: i64) -> Result<i64> {
        self.update(key, UpdateOp::Decrement(step))
    }

    /// Replaces `old` with `new`.
    pub fn cas(&self, key: &str, old: i64, new: i64) -> Result<()> {
        self.update(key, UpdateOp::CompareAndSwap { expected: old, new }).map(|_| ())
    }

    // == Clear ==
    /// Unlinks every entry. Readers holding a reference keep a valid entry
    /// until they release it.
    pub fn clear(&self) {
        let now = self.now();
        let header = self.header();
        let locks: Vec<ShmWriteGuard<'_>> = self
            .inner
            .locks
            .shards
            .iter()
            .map(SharedLock::write)
            .collect();
        let _writable = self.arena().unprotected();

        let mut removed = 0;
        for bucket in 0..header.bucket_count {
            removed += self.unlink_where(bucket, now, |_| true);
        }
        for (shard, lock) in self.shards().iter().zip(&self.inner.locks.slams) {
            shard.slam.reset(lock);
        }
        header.stats.reset(now);
        drop(locks);
        info!("Cache cleared: {} entries removed", removed);
    }

    // == Introspection ==
    pub fn stats(&self) -> CacheStats {
        self.header().stats.snapshot()
    }

    /// Arena usage, with per-segment free lists unless `limited`.
    pub fn sma_info(&self, limited: bool) -> SmaInfo {
        self.arena().sma_info(limited)
    }

    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Registry the configured serializer is resolved from. Serializers
    /// registered before the first composite value is stored are visible.
    pub fn serializers(&self) -> &SerializerRegistry {
        &self.inner.serializers
    }

    // == Internals ==
    pub(super) fn header(&self) -> &CacheHeader {
        // SAFETY: create/attach checked the control area holds a header.
        unsafe { &*(self.arena().control_ptr() as *const CacheHeader) }
    }

    pub(super) fn entry(&self, offset: u64) -> &EntryHeader {
        // SAFETY: offsets reachable from the index or the deferred list
        // point at entry headers.
        unsafe { self.arena().at(offset) }
    }

    pub(super) fn bucket(&self, index: u64) -> &AtomicU64 {
        let offset = self.header().buckets + index * size_of::<AtomicU64>() as u64;
        // SAFETY: index < bucket_count and the bucket array was zeroed.
        unsafe { self.arena().at(offset) }
    }

    fn bucket_of(&self, hash: u64) -> u64 {
        hash & (self.header().bucket_count - 1)
    }

    fn shard_index(&self, bucket: u64) -> usize {
        (bucket % u64::from(self.header().shard_count)) as usize
    }

    /// Lock guarding the chain of `bucket`.
    pub(crate) fn shard_lock(&self, bucket: u64) -> &SharedLock {
        &self.inner.locks.shards[self.shard_index(bucket)]
    }

    fn slam_of(&self, bucket: u64) -> (&SlamTable, &SharedLock) {
        let index = self.shard_index(bucket);
        (
            &self.header().shards[index].slam,
            &self.inner.locks.slams[index],
        )
    }

    pub(super) fn locks(&self) -> &StoreLocks {
        &self.inner.locks
    }

    fn shards(&self) -> &[Shard] {
        let header = self.header();
        &header.shards[..header.shard_count as usize]
    }

    fn key_of(&self, entry: &EntryHeader) -> &[u8] {
        // SAFETY: key_off/key_len describe bytes in the entry's pool.
        unsafe {
            std::slice::from_raw_parts(self.arena().ptr(entry.key_off), entry.key_len as usize)
        }
    }

    fn matches(&self, entry: &EntryHeader, hash: u64, key: &str) -> bool {
        entry.hash == hash
            && entry.key_len as usize == key.len()
            && self.key_of(entry) == key.as_bytes()
    }

    /// Offset of the entry for `key` in its chain. Needs the shard lock.
    fn lookup(&self, bucket: u64, hash: u64, key: &str) -> Option<u64> {
        let mut offset = self.bucket(bucket).load(Ordering::Acquire);
        while offset != 0 {
            let entry = self.entry(offset);
            if self.matches(entry, hash, key) {
                return Some(offset);
            }
            offset = entry.next.load(Ordering::Acquire);
        }
        None
    }

    /// Unlinks and retires every entry in a chain that `doomed` selects.
    /// Needs the shard write lock.
    pub(super) fn unlink_where<F>(&self, bucket: u64, now: u64, mut doomed: F) -> usize
    where
        F: FnMut(&EntryHeader) -> bool,
    {
        let mut link = self.bucket(bucket);
        let mut removed = 0;
        loop {
            let offset = link.load(Ordering::Acquire);
            if offset == 0 {
                break;
            }
            let entry = self.entry(offset);
            if doomed(entry) {
                link.store(entry.next.load(Ordering::Acquire), Ordering::Release);
                self.retire(offset, now);
                removed += 1;
            } else {
                link = &entry.next;
            }
        }
        removed
    }

    fn reap(&self, bucket: u64, hash: u64, key: &str, now: u64) {
        let _lock = self.shard_lock(bucket).write();
        let _writable = self.arena().unprotected();
        self.unlink_where(bucket, now, |e| {
            e.is_expired(now) && self.matches(e, hash, key)
        });
    }

    fn acquire(&self, offset: u64, now: u64) -> EntryHandle {
        let entry = self.entry(offset);
        let _writable = self.arena().unprotected();
        entry.ref_count.fetch_add(1, Ordering::SeqCst);
        entry.hits.fetch_add(1, Ordering::Relaxed);
        entry.accessed_at.store(now, Ordering::Relaxed);
        entry.handle(offset)
    }

    /// `Live -> LogicallyDeleted` for an entry already unlinked from its
    /// chain. Frees it at once if nobody holds a reference, otherwise
    /// parks it on the deferred-free list.
    fn retire(&self, offset: u64, now: u64) {
        let entry = self.entry(offset);
        let _writable = self.arena().unprotected();
        if !entry.retire(now) {
            return;
        }
        let header = self.header();
        SharedStats::drop_by(&header.stats.num_entries, 1);

        let _gc = self.locks().gc.write();
        if entry.ref_count.load(Ordering::SeqCst) == 0 {
            self.free_entry(offset);
        } else {
            entry
                .gc_next
                .store(header.gc_head.load(Ordering::Acquire), Ordering::Release);
            header.gc_head.store(offset, Ordering::Release);
        }
    }

    /// Drops a reference. The last reader of a deleted entry frees it.
    pub(super) fn release(&self, handle: EntryHandle) {
        let entry = self.entry(handle.offset);
        if entry.generation.load(Ordering::SeqCst) != handle.generation {
            warn!(
                "Entry at {} was reclaimed while still referenced",
                handle.offset
            );
            return;
        }
        let previous = {
            let _writable = self.arena().unprotected();
            entry.ref_count.fetch_sub(1, Ordering::SeqCst)
        };
        assert!(previous > 0, "entry reference count underflow");

        if previous == 1 && entry.state() == Some(EntryState::LogicallyDeleted) {
            let _gc = self.locks().gc.write();
            if self.unlink_deferred(handle.offset) {
                self.free_entry(handle.offset);
            }
        }
    }

    /// Returns a deleted entry's pool to the arena. Needs the GC lock.
    pub(super) fn free_entry(&self, offset: u64) {
        let entry = self.entry(offset);
        let _writable = self.arena().unprotected();
        let pool = PoolHandle {
            head: entry.pool_head,
            size: entry.mem_size,
        };
        if !entry.mark_freed() {
            return;
        }
        SharedStats::drop_by(&self.header().stats.mem_size, pool.size);
        pool.destroy(&self.arena());
    }

    pub(crate) fn serializer(&self) -> Result<Arc<dyn Serializer>> {
        self.inner
            .serializer
            .get_or_try_init(|| self.inner.serializers.find(&self.inner.config.serializer))
            .cloned()
    }

    fn slam_query(&self, hash: u64, key: &str, now: u64) -> Option<SlamQuery> {
        let config = &self.inner.config;
        config.slam_defense.then(|| SlamQuery {
            hash,
            key_len: key.len() as u64,
            owner: self.inner.owner,
            now,
            window_ms: config.slam_window_ms,
        })
    }

    fn slam_rejected(&self, key: &str) -> CacheError {
        SharedStats::bump(&self.header().stats.slam_rejections);
        debug!("Slam defense rejected insert of {}", key);
        CacheError::SlamGuardActive(key.to_string())
    }

    fn allocation_failed(&self, key: &str, error: CacheError) -> CacheError {
        if let CacheError::AllocationFailure { requested } = &error {
            SharedStats::bump(&self.header().stats.alloc_failures);
            warn!(
                "Unable to allocate {} bytes for {}, {} bytes free",
                requested,
                key,
                self.arena().avail()
            );
        }
        error
    }
}

// == Entry Guard ==
/// A counted reference to a live (or since deleted) entry.
#[derive(Debug)]
pub struct EntryGuard<'a> {
    store: &'a CacheStore,
    handle: EntryHandle,
}

impl EntryGuard<'_> {
    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    pub fn key(&self) -> String {
        String::from_utf8_lossy(self.store.key_of(self.entry())).into_owned()
    }

    /// Copies the value out of the arena.
    ///
    /// Integers are read atomically since updaters mutate them in place.
    /// Everything else is immutable while referenced and goes through a
    /// local pool before decoding.
    pub fn value(&self) -> Result<Value> {
        let entry = self.entry();
        let tag = entry
            .value_tag()
            .ok_or_else(|| CacheError::Serialization("unknown value tag".into()))?;
        let arena = self.store.arena();
        if tag == ValueTag::Long {
            // SAFETY: Long payloads are 8 byte, 8 aligned i64 cells.
            let cell: &AtomicI64 = unsafe { arena.at(entry.value_off) };
            return Ok(Value::Long(cell.load(Ordering::SeqCst)));
        }

        let len = entry.value_len as usize;
        let mut local = Pool::create(HeapMemory, PoolKind::Unpooled);
        // SAFETY: value_off/value_len describe bytes in the entry's pool,
        // which stays allocated while this guard holds a reference.
        let shared = unsafe { std::slice::from_raw_parts(arena.ptr(entry.value_off), len) };
        let link = local.copy_in(shared)?;
        // SAFETY: link..link+len was just filled by copy_in.
        let copied = unsafe { local.slice(link, len) };
        value::decode(tag, copied, || self.store.serializer())
    }

    /// Unix milliseconds the entry was stored.
    pub fn created_at(&self) -> u64 {
        self.entry().created_at
    }

    pub fn modified_at(&self) -> u64 {
        self.entry().modified_at.load(Ordering::Relaxed)
    }

    /// Effective TTL in seconds.
    pub fn ttl(&self) -> u32 {
        self.entry().ttl
    }

    pub fn hits(&self) -> u64 {
        self.entry().hits.load(Ordering::Relaxed)
    }

    pub fn ref_count(&self) -> u32 {
        self.entry().ref_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Option<EntryState> {
        self.entry().state()
    }

    fn entry(&self) -> &EntryHeader {
        self.store.entry(self.handle.offset)
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.store.release(self.handle);
    }
}

// == Helpers ==
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

pub(crate) fn hash_key(key: &str) -> u64 {
    xxh64(key.as_bytes(), 0)
}

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::serializer::JsonSerializer;

    const START: u64 = 1_700_000_000_000;

    fn test_config() -> Config {
        Config {
            shm_size: 1024 * 1024,
            entries_hint: 64,
            ..Config::default()
        }
    }

    fn test_store() -> (CacheStore, ManualClock) {
        let clock = ManualClock::new(START);
        let store = CacheStore::in_memory(&test_config())
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn map_value() -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("widget"));
        map.insert("tags".to_string(), Value::List(vec![Value::Long(1), Value::Null]));
        Value::Map(map)
    }

    #[test]
    fn test_store_and_fetch() {
        let (store, _) = test_store();
        store.store("k1", &Value::from("v1"), 0).unwrap();
        store.store("k2", &map_value(), 0).unwrap();

        assert_eq!(store.fetch("k1").unwrap(), Value::from("v1"));
        assert_eq!(store.fetch("k2").unwrap(), map_value());
        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.num_entries, 2);
    }

    #[test]
    fn test_fetch_missing_is_key_not_found() {
        let (store, _) = test_store();
        let result = store.fetch("missing");
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let (store, _) = test_store();
        store.store("k", &Value::Long(1), 0).unwrap();
        store.store("k", &Value::Long(2), 0).unwrap();

        assert_eq!(store.fetch("k").unwrap(), Value::Long(2));
        assert_eq!(store.stats().num_entries, 1);
    }

    #[test]
    fn test_add_rejects_live_key() {
        let (store, _) = test_store();
        store.add("k", &Value::from("first"), 0).unwrap();
        let result = store.add("k", &Value::from("second"), 0);

        assert!(matches!(result, Err(CacheError::ExclusivityConflict(_))));
        assert_eq!(store.fetch("k").unwrap(), Value::from("first"));
    }

    #[test]
    fn test_add_replaces_expired_key() {
        let (store, clock) = test_store();
        store.add("k", &Value::from("old"), 1).unwrap();
        clock.advance_ms(1_001);
        store.add("k", &Value::from("new"), 1).unwrap();
        assert_eq!(store.fetch("k").unwrap(), Value::from("new"));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let (store, _) = test_store();
        let long_key = "x".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            store.store("", &Value::Null, 0),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            store.store(&long_key, &Value::Null, 0),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(!store.exists(""));
        store.store(&"y".repeat(MAX_KEY_LENGTH), &Value::Null, 0).unwrap();
    }

    #[test]
    fn test_ttl_boundary() {
        let (store, clock) = test_store();
        store.store("k", &Value::Long(1), 10).unwrap();

        clock.advance_secs(9);
        assert!(store.exists("k"));
        clock.advance_secs(1);
        // exactly ttl seconds old is still live
        assert!(store.exists("k"));
        clock.advance_ms(1);
        assert!(!store.exists("k"));
        assert!(matches!(store.fetch("k"), Err(CacheError::KeyNotFound(_))));
        assert_eq!(store.stats().num_entries, 0);
    }

    #[test]
    fn test_default_ttl_applies_to_zero() {
        let clock = ManualClock::new(START);
        let config = Config {
            default_ttl: 5,
            ..test_config()
        };
        let store = CacheStore::in_memory(&config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        store.store("k", &Value::Bool(true), 0).unwrap();
        assert_eq!(store.find("k").unwrap().ttl(), 5);
        clock.advance_secs(6);
        assert!(!store.exists("k"));
    }

    #[test]
    fn test_delete() {
        let (store, _) = test_store();
        store.store("k", &Value::from("v"), 0).unwrap();
        store.delete("k").unwrap();
        assert!(!store.exists("k"));
        assert!(matches!(store.delete("k"), Err(CacheError::KeyNotFound(_))));
        assert_eq!(store.stats().deletes, 1);
    }

    #[test]
    fn test_deleted_entry_stays_readable_while_referenced() {
        let (store, _) = test_store();
        let before = store.arena().avail();
        store.store("k", &Value::from("payload"), 0).unwrap();

        let guard = store.find("k").unwrap();
        store.delete("k").unwrap();
        assert!(!store.exists("k"));
        assert_eq!(guard.state(), Some(EntryState::LogicallyDeleted));
        assert_eq!(guard.value().unwrap(), Value::from("payload"));
        assert!(store.arena().avail() < before);

        drop(guard);
        assert_eq!(store.arena().avail(), before);
        assert_eq!(store.stats().mem_size, 0);
    }

    #[test]
    fn test_replace_defers_free_of_referenced_entry() {
        let (store, _) = test_store();
        store.store("k", &Value::from("old"), 0).unwrap();
        let guard = store.find("k").unwrap();
        store.store("k", &Value::from("new"), 0).unwrap();

        assert_eq!(guard.value().unwrap(), Value::from("old"));
        assert_eq!(store.fetch("k").unwrap(), Value::from("new"));
        drop(guard);
        assert_eq!(store.header().gc_head.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_inc_dec() {
        let (store, _) = test_store();
        store.store("n", &Value::Long(10), 0).unwrap();
        assert_eq!(store.inc("n", 5).unwrap(), 15);
        assert_eq!(store.dec("n", 20).unwrap(), -5);
        assert_eq!(store.fetch("n").unwrap(), Value::Long(-5));
    }

    #[test]
    fn test_update_type_mismatch_leaves_value() {
        let (store, _) = test_store();
        store.store("s", &Value::from("text"), 0).unwrap();
        assert!(matches!(store.inc("s", 1), Err(CacheError::TypeMismatch(_))));
        assert_eq!(store.fetch("s").unwrap(), Value::from("text"));
        assert!(matches!(store.inc("absent", 1), Err(CacheError::KeyNotFound(_))));
    }

    #[test]
    fn test_cas() {
        let (store, _) = test_store();
        store.store("n", &Value::Long(1), 0).unwrap();
        assert!(store.cas("n", 2, 3).is_err());
        assert_eq!(store.fetch("n").unwrap(), Value::Long(1));
        store.cas("n", 1, 3).unwrap();
        assert_eq!(store.fetch("n").unwrap(), Value::Long(3));
    }

    #[test]
    fn test_clear_removes_everything() {
        let (store, _) = test_store();
        let before = store.arena().avail();
        for i in 0..50 {
            store.store(&format!("key{}", i), &Value::Long(i), 0).unwrap();
        }
        let _ = store.fetch("key1");
        store.clear();

        for i in 0..50 {
            assert!(!store.exists(&format!("key{}", i)));
        }
        let stats = store.stats();
        assert_eq!(stats.num_entries, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.start_time, START);
        assert_eq!(store.arena().avail(), before);
    }

    #[test]
    fn test_slam_defense_between_handles() {
        let clock = ManualClock::new(START);
        let a = CacheStore::in_memory(&test_config())
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let arena = Arc::clone(&a.inner.arena);
        let b = CacheStore::attach(arena, &test_config())
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        assert!(a.fetch("hot").is_err());
        clock.advance_ms(50);
        assert!(b.fetch("hot").is_err());
        clock.advance_ms(50);
        a.store("hot", &Value::Long(1), 0).unwrap();
        clock.advance_ms(100);
        assert!(matches!(
            b.store("hot", &Value::Long(2), 0),
            Err(CacheError::SlamGuardActive(_))
        ));
        assert_eq!(b.fetch("hot").unwrap(), Value::Long(1));
        assert_eq!(a.stats().slam_rejections, 1);

        clock.advance_ms(1_000);
        b.store("hot", &Value::Long(2), 0).unwrap();
    }

    #[test]
    fn test_slam_defense_disabled_last_writer_wins() {
        let config = Config {
            slam_defense: false,
            ..test_config()
        };
        let a = CacheStore::in_memory(&config).unwrap();
        let b = CacheStore::attach(Arc::clone(&a.inner.arena), &config).unwrap();
        assert!(a.fetch("hot").is_err());
        assert!(b.fetch("hot").is_err());
        a.store("hot", &Value::Long(1), 0).unwrap();
        b.store("hot", &Value::Long(2), 0).unwrap();
        assert_eq!(a.fetch("hot").unwrap(), Value::Long(2));
    }

    #[test]
    fn test_request_time_is_frozen() {
        let (store, clock) = test_store();
        store.store("k", &Value::Long(1), 1).unwrap();
        let request = store.begin_request();
        clock.advance_secs(5);
        assert!(request.exists("k"));
        assert!(!store.exists("k"));
    }

    #[test]
    fn test_allocation_failure_expunges_then_fails() {
        let (store, clock) = test_store();
        let big = Value::Str("x".repeat(200 * 1024));
        let mut stored = 0;
        while store.store(&format!("big{}", stored), &big, 1).is_ok() {
            stored += 1;
        }
        assert!(stored > 0);
        assert_eq!(store.stats().alloc_failures, 1);

        // expired entries make room on the next attempt
        clock.advance_secs(2);
        store.store("after", &big, 0).unwrap();
        assert!(store.stats().expunges >= 2);
    }

    #[test]
    fn test_unknown_serializer_only_matters_for_composites() {
        let config = Config {
            serializer: "msgpack".to_string(),
            ..test_config()
        };
        let store = CacheStore::in_memory(&config).unwrap();
        store.store("scalar", &Value::Long(1), 0).unwrap();
        assert!(matches!(
            store.store("map", &map_value(), 0),
            Err(CacheError::UnknownSerializer(_))
        ));
    }

    #[test]
    fn test_serializer_registered_after_construction() {
        let config = Config {
            serializer: "late".to_string(),
            ..test_config()
        };
        let store = CacheStore::in_memory(&config).unwrap();
        store
            .serializers()
            .register_as("late", Arc::new(JsonSerializer));
        store.store("map", &map_value(), 0).unwrap();
        assert_eq!(store.fetch("map").unwrap(), map_value());
    }

    #[test]
    fn test_batch_operations() {
        let (store, _) = test_store();
        let entries = vec![
            ("a".to_string(), Value::Long(1)),
            ("b".to_string(), Value::Long(2)),
            (String::new(), Value::Long(3)),
        ];
        assert_eq!(store.store_many(&entries, 0), vec![String::new()]);
        assert_eq!(store.add_many(&entries[..1], 0), vec!["a".to_string()]);

        let fetched = store.fetch_many(&["a", "b", "c"]);
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched["b"], Value::Long(2));
        assert_eq!(store.exists_many(&["a", "c"]), vec!["a".to_string()]);
        assert_eq!(store.delete_many(&["a", "c"]), vec!["c".to_string()]);
    }

    #[test]
    fn test_read_lock_mode() {
        let config = Config {
            write_lock: false,
            lock_shards: 8,
            ..test_config()
        };
        let store = CacheStore::in_memory(&config).unwrap();
        for i in 0..20 {
            store.store(&format!("k{}", i), &Value::Long(i), 0).unwrap();
        }
        for i in 0..20 {
            assert_eq!(store.fetch(&format!("k{}", i)).unwrap(), Value::Long(i));
        }
    }

    #[test]
    fn test_guard_metadata() {
        let (store, clock) = test_store();
        store.store("k", &Value::Double(1.5), 30).unwrap();
        clock.advance_ms(10);
        let guard = store.find("k").unwrap();
        assert_eq!(guard.key(), "k");
        assert_eq!(guard.created_at(), START);
        assert_eq!(guard.hits(), 1);
        assert_eq!(guard.ref_count(), 1);
        assert_eq!(guard.value().unwrap(), Value::Double(1.5));
    }

    #[test]
    fn test_protected_memory_mode() {
        let config = Config {
            protect_memory: true,
            ..test_config()
        };
        let store = CacheStore::in_memory(&config).unwrap();
        store.store("k", &Value::Long(1), 0).unwrap();
        assert_eq!(store.inc("k", 1).unwrap(), 2);
        store.delete("k").unwrap();
        store.store("k", &map_value(), 0).unwrap();
        assert_eq!(store.fetch("k").unwrap(), map_value());
    }

    #[test]
    fn test_leaked_shard_lock_panics_waiter() {
        let config = Config {
            lock_timeout_ms: 200,
            ..test_config()
        };
        let store = CacheStore::in_memory(&config).unwrap();
        store.store("k", &Value::Long(1), 0).unwrap();
        // a holder that died without releasing
        std::mem::forget(store.shard_lock(0).write());

        let started = std::time::Instant::now();
        let waited = std::thread::scope(|s| s.spawn(|| store.exists("k")).join());
        assert!(waited.is_err());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_attached_handle_shares_locks() {
        let (store, _) = test_store();
        let other = CacheStore::attach(store.inner.arena.clone(), store.config()).unwrap();
        let _held = store.shard_lock(0).write();
        assert!(other.shard_lock(0).try_write().is_none());
    }
}
