/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The seam between the signal handshake and whatever turns a captured
//! register set into a list of frames.

use {
    crate::{
        errors::{ReadMemoryError, WalkError},
        linux::Registers,
    },
    std::sync::Arc,
};

/// One entry of a walked stack, innermost first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Position in the returned list.
    pub num: usize,
    /// The instruction pointer for frame 0, a return address for the others.
    pub pc: u64,
    pub is_return_address: bool,
    /// Name of the module containing `pc`, if the walker knows it.
    pub module: Option<Arc<str>>,
}

/// Filters forwarded untouched from the caller to the walker.
#[derive(Clone, Debug, Default)]
pub struct WalkOptions {
    pub max_frames: usize,
    pub initial_frames_to_skip: usize,
    /// Unwinding stops at the first frame inside a module whose name ends
    /// with one of these suffixes.
    pub module_suffixes_to_ignore: Vec<String>,
}

impl WalkOptions {
    pub fn ignores_module(&self, module: &str) -> bool {
        self.module_suffixes_to_ignore
            .iter()
            .any(|suffix| module.ends_with(suffix.as_str()))
    }
}

/// Readable-by-address view of a process.
pub trait MemoryView {
    /// Reads up to `dst.len()` bytes at `address`, returning how many were
    /// read.
    fn read(&mut self, address: u64, dst: &mut [u8]) -> Result<usize, ReadMemoryError>;

    fn read_u64(&mut self, address: u64) -> Result<u64, ReadMemoryError> {
        let mut bytes = [0u8; 8];
        self.read_exact(address, &mut bytes)?;
        Ok(u64::from_ne_bytes(bytes))
    }

    fn read_exact(&mut self, address: u64, dst: &mut [u8]) -> Result<(), ReadMemoryError> {
        let read = self.read(address, dst)?;
        if read < dst.len() {
            return Err(ReadMemoryError {
                pid: 0,
                address,
                offset: read,
                length: dst.len(),
                source: nix::errno::Errno::EFAULT,
            });
        }
        Ok(())
    }
}

/// Produces frames from a captured register set.
///
/// Called on the requesting thread while the target is parked inside its
/// signal handler, so the stack described by `memory` is stable for the
/// duration of the call.
pub trait StackWalker {
    fn walk(
        &mut self,
        regs: &Registers,
        memory: &mut dyn MemoryView,
        options: &WalkOptions,
    ) -> Result<Vec<Frame>, WalkError>;
}

impl<W: StackWalker + ?Sized> StackWalker for Box<W> {
    fn walk(
        &mut self,
        regs: &Registers,
        memory: &mut dyn MemoryView,
        options: &WalkOptions,
    ) -> Result<Vec<Frame>, WalkError> {
        (**self).walk(regs, memory, options)
    }
}
