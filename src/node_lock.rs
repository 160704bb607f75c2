//! A fair rwlock. Inspired by [qrwlock from linux](https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/include/asm-generic/qrwlock.h)
//!
//! This is the per-node lock described by the engine's locking discipline:
//! a `request` gate (the ticket mutex `wq` below) that serializes new
//! arrivals, and a packed reader-count/writer-state word that plays the role
//! of the `num_readers` counter and the `node` mutex combined. Serializing
//! arrivals behind `wq` is what prevents a continuous stream of readers from
//! starving a writer, matching the writer-non-starvation requirement of the
//! locking discipline this module backs.

use std::{
    cell::UnsafeCell,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};
use spin::{mutex::TicketMutex, relax::Spin, RelaxStrategy};

const WRITER_LOCKED: u32 = 0xff;
const WRITER_WAITING: u32 = 1 << 8;
const WRITER_MASK: u32 = WRITER_LOCKED | WRITER_WAITING;
const READER_COUNT: u32 = 1 << 9;

#[cfg(target_endian = "big")]
#[repr(C)]
struct RawRwLockBits {
    padd: [u8; 3],
    w_lock: ManuallyDrop<AtomicU8>,
}

#[cfg(target_endian = "little")]
#[repr(C)]
struct RawRwLockBits {
    w_lock: ManuallyDrop<AtomicU8>,
    padd: [u8; 3],
}

#[repr(C)]
union RawRwlock {
    bits: ManuallyDrop<AtomicU32>,
    raw: ManuallyDrop<RawRwLockBits>,
}

static_assertions::const_assert!(core::mem::size_of::<RawRwlock>() == core::mem::size_of::<u32>());

/// A [read-write lock](https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock) used to
/// guard every field of a single tree node (name, value, and both child links).
///
/// This lock acts as `std::sync::RwLock`, but uses spinning as a backoff
/// mechanism and is not prone to reader or writer starvation: unlike a naive
/// reader-preferring or writer-preferring rwlock, arrivals are serialized
/// FIFO behind a ticket-mutex request gate, so a writer queued behind a
/// reader is served before any reader that arrives later.
pub struct RwLock<T> {
    raw: RawRwlock,
    data: UnsafeCell<T>,
    /// The `request` gate: a ticket mutex that serializes new arrivals so
    /// membership in the current reader/writer window is decided atomically
    /// with respect to other requests.
    request: TicketMutex<()>,
}

/// Guard that provides read-only access to underlying data.
pub struct ReadGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    data: &'a T,
}

/// Guard that provides read-write access to underlying data.
/// `WriteGuard<T>` guarantees exclusive access.
pub struct WriteGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    data: &'a mut T,
}

/// Either kind of guard, used by the lock-coupling search primitive to carry
/// a lock of statically-unknown mode out of one stack frame and into the
/// caller's, per the mode table of the search routine.
pub enum Held<'a, T: 'a> {
    Read(ReadGuard<'a, T>),
    Write(WriteGuard<'a, T>),
}

impl<'a, T> Held<'a, T> {
    pub fn as_write(&mut self) -> Option<&mut WriteGuard<'a, T>> {
        match self {
            Held::Write(w) => Some(w),
            Held::Read(_) => None,
        }
    }

    pub fn into_write(self) -> Option<WriteGuard<'a, T>> {
        match self {
            Held::Write(w) => Some(w),
            Held::Read(_) => None,
        }
    }
}

impl<T> RwLock<T> {
    /// Creates a new node lock wrapping passed data.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            request: TicketMutex::new(()),
            raw: unsafe { core::mem::zeroed() },
            data: UnsafeCell::new(data),
        }
    }

    /// Tries to acquire the lock for write.
    ///
    /// Returns `Some(WriteGuard<T>)` if the lock was acquired, `None` otherwise.
    #[inline(always)]
    pub fn write_try_lock(&self) -> Option<WriteGuard<T>> {
        let raw = self.raw(Ordering::Relaxed);

        if raw == 0
            && unsafe {
                self.raw
                    .bits
                    .compare_exchange(0, WRITER_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            }
        {
            Some(WriteGuard {
                lock: self,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }

    /// Tries to acquire the lock for read.
    ///
    /// Returns `Some(ReadGuard<T>)` if the lock was acquired, `None` otherwise.
    #[inline(always)]
    pub fn read_try_lock(&self) -> Option<ReadGuard<T>> {
        let mut raw = self.raw(Ordering::Relaxed);

        if raw & WRITER_MASK == 0 {
            raw = self.add_read_count(Ordering::Acquire);
            if raw & WRITER_MASK == 0 {
                Some(ReadGuard {
                    lock: self,
                    data: unsafe { &*self.data.get() },
                })
            } else {
                None
            }
        } else {
            None
        }
    }

    fn wait_for_writes_to_unlock(&self) {
        loop {
            let cur = self.raw(Ordering::Acquire);

            if cur & WRITER_MASK == 0 {
                break;
            }

            Spin::relax();
        }
    }

    pub(crate) fn raw(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.load(order) }
    }

    #[inline(always)]
    fn add_read_count(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.fetch_add(READER_COUNT, order) }
    }

    #[inline(always)]
    pub(crate) fn sub_read_count(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.fetch_sub(READER_COUNT, order) }
    }

    #[inline(always)]
    fn read_lock_fast(&self) -> bool {
        let state = self.add_read_count(Ordering::Acquire);

        if (state & WRITER_MASK) == 0 {
            true
        } else {
            // Maintaining the counter only, no ordering is needed for the rollback.
            self.sub_read_count(Ordering::Relaxed);
            false
        }
    }

    #[inline(always)]
    fn write_lock_fast(&self) -> bool {
        unsafe {
            self.raw
                .bits
                .compare_exchange(0, WRITER_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }
    }

    fn read_lock_slow(&self) {
        // Forces this arrival to queue behind any writer already waiting.
        let _guard = self.request.lock();

        self.add_read_count(Ordering::Relaxed);

        self.wait_for_writes_to_unlock();
    }

    fn write_lock_slow(&self) {
        let _guard = self.request.lock();

        if self.raw(Ordering::Relaxed) == 0 && self.write_lock_fast() {
            return;
        }

        unsafe { self.raw.bits.fetch_or(WRITER_WAITING, Ordering::Relaxed) };

        loop {
            let raw = self.raw(Ordering::Relaxed);

            if raw == WRITER_WAITING
                && unsafe {
                    self.raw
                        .bits
                        .compare_exchange(
                            WRITER_WAITING,
                            WRITER_LOCKED,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                }
            {
                return;
            }

            Spin::relax();
        }
    }

    /// Acquires the lock for read.
    ///
    /// If the lock is held for write, the calling thread queues behind
    /// `request` until the writer releases it. Divided into an inlined fast
    /// path and an un-inlined slow path.
    #[inline(always)]
    pub fn read(&self) -> ReadGuard<T> {
        if !self.read_lock_fast() {
            self.read_lock_slow();
        }

        ReadGuard {
            lock: self,
            data: unsafe { &*self.data.get() },
        }
    }

    /// Acquires the lock for write.
    ///
    /// Divided into an inlined fast path and an un-inlined slow path.
    #[inline(always)]
    pub fn write(&self) -> WriteGuard<T> {
        if !self.write_lock_fast() {
            self.write_lock_slow();
        }

        WriteGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    #[inline(always)]
    pub(crate) fn write_unlock(&self) {
        unsafe { self.raw.raw.w_lock.store(0, Ordering::Release) };
    }

    /// Raw pointer to the protected data, bypassing the RAII guards.
    ///
    /// Used by the tree engine's node-holding wrapper, which must carry a
    /// held lock across a function return (something a borrow tied to a
    /// `ReadGuard`/`WriteGuard` cannot do). Callers are responsible for
    /// holding the matching lock mode for as long as the pointer is
    /// dereferenced.
    pub(crate) fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Direct mutable access to the protected data, requiring no lock
    /// acquisition because the `&mut self` borrow already proves exclusivity
    /// (mirrors `std::sync::RwLock::get_mut`).
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquires the read lock without constructing a `ReadGuard`. Pairs with
    /// [`read_unlock_raw`](Self::read_unlock_raw).
    pub(crate) fn read_lock_raw(&self) {
        if !self.read_lock_fast() {
            self.read_lock_slow();
        }
    }

    /// Releases a lock acquired by [`read_lock_raw`](Self::read_lock_raw).
    pub(crate) fn read_unlock_raw(&self) {
        self.sub_read_count(Ordering::Release);
    }

    /// Acquires the write lock without constructing a `WriteGuard`. Pairs
    /// with [`write_unlock_raw`](Self::write_unlock_raw).
    pub(crate) fn write_lock_raw(&self) {
        if !self.write_lock_fast() {
            self.write_lock_slow();
        }
    }

    /// Releases a lock acquired by [`write_lock_raw`](Self::write_lock_raw).
    pub(crate) fn write_unlock_raw(&self) {
        self.write_unlock();
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.sub_read_count(Ordering::Release);
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

unsafe impl<T> Sync for RwLock<T> {}
unsafe impl<T> Send for RwLock<T> {}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_threaded_exclusion() {
        let lock = RwLock::new(());

        let locked = lock.write();
        assert!(lock.read_try_lock().is_none());
        assert!(lock.write_try_lock().is_none());
        drop(locked);

        let _locked1 = lock.read();
        let _locked2 = lock.read();

        assert!(lock.write_try_lock().is_none());
    }

    #[test]
    fn held_enum_carries_either_mode() {
        let lock = RwLock::new(5);
        let mut held = Held::Read(lock.read());
        assert!(held.as_write().is_none());

        let lock2 = RwLock::new(5);
        let held2 = Held::Write(lock2.write());
        assert!(held2.into_write().is_some());
    }

    #[test]
    fn multi_threaded_exclusion() {
        const READ_NUM_THREADS: usize = 10;
        const WRITE_NUM_THREADS: usize = 2;
        const WRITE_LOCK: usize = 1 << 31;

        let lock = Arc::new(RwLock::new(0));
        let r_ths: Vec<_> = (0..READ_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();

                    for _ in 0..100 {
                        let locked = lock.read();
                        assert!(*locked & WRITE_LOCK == 0);
                        thread::sleep(Duration::from_millis(rng.gen_range(1..3)));
                        drop(locked);

                        thread::yield_now();
                    }
                })
            })
            .collect();

        let w_ths: Vec<_> = (0..WRITE_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();

                    for _ in 0..100 {
                        let mut locked = lock.write();
                        assert!(*locked & WRITE_LOCK == 0);
                        *locked |= WRITE_LOCK;
                        thread::sleep(Duration::from_millis(rng.gen_range(1..3)));
                        *locked &= !WRITE_LOCK;
                        drop(locked);

                        thread::yield_now();
                    }
                })
            })
            .collect();

        for th in r_ths {
            th.join().unwrap();
        }

        for th in w_ths {
            th.join().unwrap();
        }
    }
}
