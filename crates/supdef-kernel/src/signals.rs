//! Signal/timeout manager.
//!
//! Arbitrates a finite set of process-wide signal numbers — the realtime
//! range `SIGRTMIN..=SIGRTMAX` plus `SIGUSR1`/`SIGUSR2` — among callers
//! identified by opaque string ids, and bridges deadlines into cross-thread
//! cancellation events.
//!
//! # Concurrency contract
//!
//! Exactly one dedicated thread calls the blocking `sigwait`; every other
//! thread keeps the managed set blocked in its mask so delivery is observed
//! only by the listener. [`SignalManager::init`] must run on the process's
//! first thread, before any other thread is spawned — the mask is inherited
//! at thread creation, and a thread created earlier with the set unblocked
//! could steal (and die from) a managed signal.
//!
//! The listener maps an arriving signal number to its lease and fires the
//! lease's [`CancellationToken`]; execution tasks treat that as a
//! cooperative cancellation request, not an interrupt of their own control
//! flow. Lease-table mutations serialize under one lock; queries take
//! read-lock snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Owner id of the internal lease used to wake the listener at shutdown.
const LISTENER_ID: &str = "signal-listener";

/// One claimed signal number.
#[derive(Debug)]
struct Lease {
    owner: String,
    token: CancellationToken,
}

struct ListenerHandle {
    thread: JoinHandle<()>,
    thread_id: ThreadId,
    stop_signo: i32,
}

/// Process-wide arbiter for the managed signal set.
///
/// Built explicitly and injected (the engine owns one; tests build a fresh
/// instance per case). The lease table is per-instance; the signal mask is
/// a process property and is initialized once, idempotently.
pub struct SignalManager {
    leases: RwLock<HashMap<i32, Lease>>,
    listener: Mutex<Option<ListenerHandle>>,
    running: AtomicBool,
    stopping: AtomicBool,
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalManager {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// The managed numbers, in assignment preference order: the realtime
    /// range first, then the two general-purpose signals.
    pub fn managed_signals() -> Vec<i32> {
        let mut set: Vec<i32> = (libc::SIGRTMIN()..=libc::SIGRTMAX()).collect();
        set.push(libc::SIGUSR1);
        set.push(libc::SIGUSR2);
        set
    }

    fn rt_range() -> std::ops::RangeInclusive<i32> {
        libc::SIGRTMIN()..=libc::SIGRTMAX()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i32, Lease>> {
        self.leases.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i32, Lease>> {
        self.leases.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Block the managed set in the calling thread's mask.
    ///
    /// Idempotent. Must run on the process's first thread before any other
    /// thread adjusts its mask; threads spawned afterwards inherit it.
    pub fn init() {
        static INIT: Once = Once::new();
        INIT.call_once(|| unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for n in Self::managed_signals() {
                libc::sigaddset(&mut set, n);
            }
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        });
    }

    /// Is `n` a free realtime-class number?
    pub fn is_rt_usable(&self, n: i32) -> bool {
        Self::rt_range().contains(&n) && !self.read().contains_key(&n)
    }

    /// Is `n` managed and free?
    pub fn is_usable(&self, n: i32) -> bool {
        Self::managed_signals().contains(&n) && !self.read().contains_key(&n)
    }

    /// Atomically claim a free number for `id`. Returns the assigned
    /// number, or `None` when every managed number is leased.
    pub fn register_use(&self, id: &str) -> Option<i32> {
        let mut map = self.write();
        for n in Self::managed_signals() {
            if let std::collections::hash_map::Entry::Vacant(e) = map.entry(n) {
                e.insert(Lease {
                    owner: id.to_string(),
                    token: CancellationToken::new(),
                });
                debug!(signo = n, owner = id, "signal leased");
                return Some(n);
            }
        }
        None
    }

    /// Claim a specific number for `id`.
    ///
    /// Returns `false` — never an error — when `n` is unmanaged or held by
    /// another id; callers must check the flag.
    #[deprecated(note = "explicit numbers race with other owners; use register_use")]
    pub fn register_use_of(&self, id: &str, n: i32) -> bool {
        if !Self::managed_signals().contains(&n) {
            return false;
        }
        let mut map = self.write();
        match map.entry(n) {
            std::collections::hash_map::Entry::Occupied(e) => e.get().owner == id,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(Lease {
                    owner: id.to_string(),
                    token: CancellationToken::new(),
                });
                true
            }
        }
    }

    /// Release every lease held by `id`. No-op for an unknown id.
    pub fn unregister(&self, id: &str) {
        self.write().retain(|_, lease| lease.owner != id);
    }

    /// Release `n` if held by `id`. No-op otherwise.
    pub fn unregister_one(&self, id: &str, n: i32) {
        let mut map = self.write();
        if map.get(&n).is_some_and(|l| l.owner == id) {
            map.remove(&n);
        }
    }

    /// Release `n` regardless of owner. No-op when unheld.
    pub fn release(&self, n: i32) {
        self.write().remove(&n);
    }

    /// The numbers currently held by `id`, ascending.
    pub fn held_by(&self, id: &str) -> Vec<i32> {
        let mut held: Vec<i32> = self
            .read()
            .iter()
            .filter(|(_, l)| l.owner == id)
            .map(|(n, _)| *n)
            .collect();
        held.sort_unstable();
        held
    }

    /// The cancellation token tied to `n`'s lease.
    pub fn token_for(&self, n: i32) -> Option<CancellationToken> {
        self.read().get(&n).map(|l| l.token.clone())
    }

    /// Fire the cancellation event for `n`'s lease. Returns whether a
    /// lease was found. The lease stays held; its owner releases it.
    pub fn cancel(&self, n: i32) -> bool {
        match self.read().get(&n) {
            Some(lease) => {
                lease.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Bridge a deadline expiry into cancellation of `n`'s lease.
    ///
    /// With the listener running the signal is actually raised
    /// (process-directed, so only the listener's `sigwait` observes it);
    /// without one — test configurations — the token is cancelled
    /// directly.
    pub fn deadline_expired(&self, n: i32) {
        if self.running.load(Ordering::SeqCst) {
            // kill(getpid()), not raise(): raise targets the calling
            // thread, whose blocked mask would hold the signal pending
            // forever instead of handing it to the listener.
            unsafe {
                libc::kill(libc::getpid(), n);
            }
        } else {
            self.cancel(n);
        }
    }

    /// Whether the listener thread is running.
    pub fn listener_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the calling thread is the listener.
    pub fn is_listener(&self) -> bool {
        let guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .is_some_and(|h| h.thread_id == thread::current().id())
    }

    /// Spawn the dedicated listener thread. Idempotent while running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        Self::init();
        let mut guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        let stop_signo = self
            .register_use(LISTENER_ID)
            .context("no free signal number for listener shutdown")?;
        self.stopping.store(false, Ordering::SeqCst);
        let mgr = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("supdef-signal-listener".to_string())
            .spawn(move || mgr.listen(stop_signo))
            .context("spawning signal listener thread")?;
        let thread_id = thread.thread().id();
        *guard = Some(ListenerHandle {
            thread,
            thread_id,
            stop_signo,
        });
        self.running.store(true, Ordering::SeqCst);
        debug!(stop_signo, "signal listener started");
        Ok(())
    }

    /// Stop the listener (if running) and force-release every remaining
    /// lease, cancelling their tokens so blocked waiters observe shutdown.
    pub fn stop(&self) {
        let handle = {
            let mut guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(h) = handle {
            self.stopping.store(true, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            unsafe {
                libc::kill(libc::getpid(), h.stop_signo);
            }
            if h.thread.join().is_err() {
                warn!("signal listener thread panicked");
            }
        }
        let mut map = self.write();
        for (n, lease) in map.drain() {
            debug!(signo = n, owner = %lease.owner, "force-releasing lease at shutdown");
            lease.token.cancel();
        }
    }

    /// Listener loop: the one blocking `sigwait` in the process.
    fn listen(&self, stop_signo: i32) {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            for n in Self::managed_signals() {
                libc::sigaddset(&mut set, n);
            }
        }
        loop {
            let mut got: libc::c_int = 0;
            let rc = unsafe { libc::sigwait(&set, &mut got) };
            if rc != 0 {
                warn!(rc, "sigwait failed; listener exiting");
                break;
            }
            if got == stop_signo && self.stopping.load(Ordering::SeqCst) {
                break;
            }
            debug!(signo = got, "signal observed; firing cancellation");
            self.cancel(got);
        }
    }
}
