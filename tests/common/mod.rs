use std::arch::asm;
use std::hint::black_box;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thread_unwinder::{ThreadEntry, Tid};

#[allow(unused)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(unused)]
pub fn signal(offset: libc::c_int) -> libc::c_int {
    thread_unwinder::rt_signal(offset).expect("not enough realtime signals")
}

/// Polls until no live slot exists for `tid`. The handler drops its own
/// reference slightly after the requester returns.
#[allow(unused)]
pub fn wait_until_unregistered(tid: Tid) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while ThreadEntry::is_registered(tid) {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

fn fibonacci(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        black_box(fibonacci(n - 1)) + black_box(fibonacci(n - 2))
    }
}

/// A thread that keeps computing until dropped, counting finished rounds.
pub struct Worker {
    tid: Tid,
    stop: Arc<AtomicBool>,
    unblock: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    #[allow(unused)]
    pub fn spawn() -> Worker {
        Self::spawn_blocking(None)
    }

    /// Spawns a worker that blocks `signal` until [`Worker::unblock`].
    pub fn spawn_blocking(blocked: Option<libc::c_int>) -> Worker {
        let stop = Arc::new(AtomicBool::new(false));
        let unblock = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();

        let handle = {
            let stop = stop.clone();
            let unblock = unblock.clone();
            let progress = progress.clone();
            thread::Builder::new()
                .name("unwind-target".into())
                .spawn(move || {
                    if let Some(signal) = blocked {
                        change_mask(libc::SIG_BLOCK, signal);
                    }
                    tx.send(nix::unistd::gettid().as_raw()).unwrap();

                    let mut unblocked = blocked.is_none();
                    while !stop.load(Ordering::Relaxed) {
                        if !unblocked && unblock.load(Ordering::Relaxed) {
                            change_mask(libc::SIG_UNBLOCK, blocked.unwrap());
                            unblocked = true;
                        }
                        black_box(fibonacci(black_box(15)));
                        progress.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .expect("failed to spawn worker")
        };

        let tid = rx.recv().expect("worker did not report its tid");
        Worker {
            tid,
            stop,
            unblock,
            progress,
            handle: Some(handle),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[allow(unused)]
    pub fn unblock(&self) {
        self.unblock.store(true, Ordering::Relaxed);
    }

    /// Whether the worker keeps making progress.
    #[allow(unused)]
    pub fn is_running(&self) -> bool {
        let start = self.progress.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.progress.load(Ordering::Relaxed) > start + 1 {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn change_mask(how: libc::c_int, signal: libc::c_int) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        assert_eq!(
            libc::pthread_sigmask(how, &set, std::ptr::null_mut()),
            0,
            "pthread_sigmask failed"
        );
    }
}

/// Returns the tid of a thread that has already exited.
#[allow(unused)]
pub fn exited_thread() -> Tid {
    thread::spawn(|| nix::unistd::gettid().as_raw())
        .join()
        .expect("thread panicked")
}

/// Spins on `*stop == 0` inside an asm block, storing the block's first and
/// last code address to `bounds` before entering the loop.
///
/// # Safety
///
/// `stop` must be readable and `bounds` writable for two words until the
/// loop exits.
#[inline(never)]
unsafe fn spin_until_stopped(stop: *const u8, bounds: *mut usize) {
    #[cfg(target_arch = "x86_64")]
    asm!(
        "2:",
        "lea {tmp}, [rip + 2b]",
        "mov [{bounds}], {tmp}",
        "lea {tmp}, [rip + 4f]",
        "mov [{bounds} + 8], {tmp}",
        "3:",
        "pause",
        "cmp byte ptr [{stop}], 0",
        "je 3b",
        "4:",
        stop = in(reg) stop,
        bounds = in(reg) bounds,
        tmp = out(reg) _,
    );

    #[cfg(target_arch = "aarch64")]
    asm!(
        "2:",
        "adr {tmp}, 2b",
        "str {tmp}, [{bounds}]",
        "adr {tmp}, 4f",
        "str {tmp}, [{bounds}, #8]",
        "3:",
        "yield",
        "ldrb {flag:w}, [{stop}]",
        "cbz {flag:w}, 3b",
        "4:",
        stop = in(reg) stop,
        bounds = in(reg) bounds,
        tmp = out(reg) _,
        flag = out(reg) _,
    );
}

/// A thread parked in a call-free loop whose code addresses are known, so
/// the interrupted pc can be checked exactly.
pub struct Spinner {
    tid: Tid,
    stop: Arc<AtomicU8>,
    bounds: Arc<[AtomicUsize; 2]>,
    done: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    #[allow(unused)]
    pub fn spawn() -> Spinner {
        let stop = Arc::new(AtomicU8::new(0));
        let bounds = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let handle = {
            let stop = stop.clone();
            let bounds = bounds.clone();
            thread::Builder::new()
                .name("unwind-spinner".into())
                .spawn(move || {
                    tid_tx.send(nix::unistd::gettid().as_raw()).unwrap();
                    unsafe { spin_until_stopped(stop.as_ptr(), bounds.as_ptr() as *mut usize) };
                    let _ = done_tx.send(());
                })
                .expect("failed to spawn spinner")
        };

        let tid = tid_rx.recv().expect("spinner did not report its tid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while bounds[1].load(Ordering::Acquire) == 0 {
            assert!(Instant::now() < deadline, "spinner never entered its loop");
            thread::sleep(Duration::from_millis(1));
        }

        Spinner {
            tid,
            stop,
            bounds,
            done: done_rx,
            handle: Some(handle),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[allow(unused)]
    pub fn code_range(&self) -> RangeInclusive<u64> {
        let start = self.bounds[0].load(Ordering::Acquire) as u64;
        let end = self.bounds[1].load(Ordering::Acquire) as u64;
        start..=end
    }

    /// Stops the loop; returns whether the thread left it in time.
    #[allow(unused)]
    pub fn stop(&self) -> bool {
        self.stop.store(1, Ordering::Release);
        self.done.recv_timeout(Duration::from_secs(5)).is_ok()
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop.store(1, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
