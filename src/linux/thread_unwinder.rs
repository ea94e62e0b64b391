/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

use {
    super::{
        mem_reader::ProcessMemory,
        registers::{CapturedContext, Registers},
        request::{self, Timeouts},
        thread_entry::Phase,
    },
    crate::{
        errors::{Tid, UnwindError},
        framehop_walker::FramehopWalker,
        frames::{Frame, StackWalker, WalkOptions},
    },
    libc::c_int,
    std::time::Duration,
};

/// The default upper bound on the number of frames returned by an unwind.
pub const DEFAULT_MAX_FRAMES: usize = 512;

/// How long to wait for the target thread to enter its handler and publish
/// its context.
pub const CONTEXT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the target thread to acknowledge that it resumed
/// after the walk.
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the target thread stays parked in its handler waiting for the
/// walk to complete before it gives up and resumes on its own.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// The result of a successful unwind.
#[derive(Debug, Clone)]
pub struct ThreadUnwind {
    pub frames: Vec<Frame>,
    /// The registers the walk was seeded with. Their pc and sp are those of
    /// the first frame.
    pub initial_registers: Registers,
    pub context: CapturedContext,
}

/// Captures the stack of other threads of this process.
///
/// Requests made through any number of unwinders, from any number of
/// threads, are safe to run concurrently. Requests that install a handler
/// are serialized process wide.
pub struct ThreadUnwinder<W: StackWalker = FramehopWalker> {
    walker: W,
    memory: ProcessMemory,
    options: WalkOptions,
    context_timeout: Duration,
    restart_timeout: Duration,
    handler_timeout: Duration,
}

impl ThreadUnwinder<FramehopWalker> {
    pub fn new(max_frames: usize) -> Self {
        Self::with_walker(FramehopWalker::new(), max_frames)
    }
}

impl<W: StackWalker> ThreadUnwinder<W> {
    /// Uses `walker` for the stack walks. Unwinders that should share
    /// registered modules can be built from clones of one walker.
    pub fn with_walker(walker: W, max_frames: usize) -> Self {
        Self {
            walker,
            memory: ProcessMemory::new(),
            options: WalkOptions {
                max_frames,
                ..Default::default()
            },
            context_timeout: CONTEXT_TIMEOUT,
            restart_timeout: RESTART_TIMEOUT,
            handler_timeout: HANDLER_TIMEOUT,
        }
    }

    pub fn set_max_frames(&mut self, max_frames: usize) -> &mut Self {
        self.options.max_frames = max_frames;
        self
    }

    pub fn set_initial_frames_to_skip(&mut self, count: usize) -> &mut Self {
        self.options.initial_frames_to_skip = count;
        self
    }

    /// Stops unwinding at the first frame that lies in a module whose name
    /// ends with one of `suffixes`.
    pub fn set_module_suffixes_to_ignore<I, S>(&mut self, suffixes: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.module_suffixes_to_ignore = suffixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn context_timeout(&mut self, duration: Duration) -> &mut Self {
        self.context_timeout = duration;
        self
    }

    pub fn restart_timeout(&mut self, duration: Duration) -> &mut Self {
        self.restart_timeout = duration;
        self
    }

    pub fn handler_timeout(&mut self, duration: Duration) -> &mut Self {
        self.handler_timeout = duration;
        self
    }

    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    pub fn walker(&self) -> &W {
        &self.walker
    }

    pub fn walker_mut(&mut self) -> &mut W {
        &mut self.walker
    }

    /// Interrupts thread `tid` with `signal`, walks its stack while it is
    /// parked in the handler and lets it resume.
    ///
    /// `signal` should be a real-time signal nothing else in the process
    /// uses, see [`rt_signal`]. Its disposition is swapped for the duration
    /// of the request and restored afterwards.
    pub fn unwind_with_signal(
        &mut self,
        signal: c_int,
        tid: Tid,
    ) -> Result<ThreadUnwind, UnwindError> {
        let timeouts = Timeouts {
            context: self.context_timeout,
            handler: self.handler_timeout,
        };
        let request = request::prepare(tid, signal, &timeouts)?;
        let entry = request.entry();

        // SAFETY: prepare() only returns once the phase is ContextCaptured,
        // and the target does not touch the context until we advance it.
        let context = unsafe { entry.context() };
        let initial_registers = context.registers();

        let walked = self
            .walker
            .walk(&initial_registers, &mut self.memory, &self.options);

        // Let the target resume, whatever the outcome of the walk.
        entry.wake();
        if !entry.wait(Phase::ThreadRestarted, self.restart_timeout) {
            log::warn!(
                "Thread {tid} did not acknowledge its restart within {:?}",
                self.restart_timeout
            );
        }
        drop(request);

        let frames = walked.map_err(|source| UnwindError::StackWalkFailed { tid, source })?;
        log::debug!("Unwound {} frames of thread {tid}", frames.len());

        Ok(ThreadUnwind {
            frames,
            initial_registers,
            context,
        })
    }
}

/// Returns `SIGRTMIN + offset` if that is still a real-time signal.
pub fn rt_signal(offset: c_int) -> Option<c_int> {
    let signal = libc::SIGRTMIN().checked_add(offset)?;
    (offset >= 0 && signal <= libc::SIGRTMAX()).then_some(signal)
}

/// Captures the stack of thread `tid` of this process with a default
/// unwinder.
pub fn unwind_other_thread(
    tid: Tid,
    signal: c_int,
    initial_frames_to_skip: usize,
    module_suffixes_to_ignore: &[&str],
) -> Result<Vec<Frame>, UnwindError> {
    let mut unwinder = ThreadUnwinder::new(DEFAULT_MAX_FRAMES);
    unwinder
        .set_initial_frames_to_skip(initial_frames_to_skip)
        .set_module_suffixes_to_ignore(module_suffixes_to_ignore.iter().copied());
    unwinder
        .unwind_with_signal(signal, tid)
        .map(|unwind| unwind.frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_signal_range() {
        assert_eq!(rt_signal(0), Some(libc::SIGRTMIN()));
        assert_eq!(
            rt_signal(libc::SIGRTMAX() - libc::SIGRTMIN()),
            Some(libc::SIGRTMAX())
        );
        assert_eq!(rt_signal(libc::SIGRTMAX() - libc::SIGRTMIN() + 1), None);
        assert_eq!(rt_signal(-1), None);
    }

    #[test]
    fn builder_sets_options() {
        let mut unwinder = ThreadUnwinder::new(DEFAULT_MAX_FRAMES);
        unwinder
            .set_max_frames(16)
            .set_initial_frames_to_skip(2)
            .set_module_suffixes_to_ignore(["libc.so.6"])
            .context_timeout(Duration::from_millis(50))
            .restart_timeout(Duration::from_millis(60))
            .handler_timeout(Duration::from_millis(70));

        assert_eq!(unwinder.options().max_frames, 16);
        assert_eq!(unwinder.options().initial_frames_to_skip, 2);
        assert_eq!(
            unwinder.options().module_suffixes_to_ignore,
            vec!["libc.so.6".to_owned()]
        );
        assert_eq!(unwinder.context_timeout, Duration::from_millis(50));
        assert_eq!(unwinder.restart_timeout, Duration::from_millis(60));
        assert_eq!(unwinder.handler_timeout, Duration::from_millis(70));
    }

    #[test]
    fn defaults() {
        let unwinder = ThreadUnwinder::new(DEFAULT_MAX_FRAMES);
        assert_eq!(unwinder.options().max_frames, 512);
        assert_eq!(unwinder.options().initial_frames_to_skip, 0);
        assert!(unwinder.options().module_suffixes_to_ignore.is_empty());
        assert_eq!(unwinder.context_timeout, CONTEXT_TIMEOUT);
        assert_eq!(unwinder.restart_timeout, RESTART_TIMEOUT);
        assert_eq!(unwinder.handler_timeout, HANDLER_TIMEOUT);
    }
}
