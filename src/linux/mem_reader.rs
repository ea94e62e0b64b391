/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Fault-free reads of this process's memory, for walking the stack of a
//! thread that is parked in a signal handler.

use {
    crate::{errors::ReadMemoryError, frames::MemoryView},
    nix::{
        errno::Errno,
        sys::uio::{process_vm_readv, RemoteIoVec},
        unistd::Pid,
    },
    std::{fs::File, io::IoSliceMut, os::unix::fs::FileExt},
};

enum Style {
    /// Uses [`process_vm_readv`](https://man7.org/linux/man-pages/man2/process_vm_readv.2.html),
    /// which reports unmapped ranges with `EFAULT` instead of faulting.
    VirtualMem,
    /// Reads from `/proc/<pid>/mem`, for kernels or sandboxes without
    /// `process_vm_readv`.
    File(File),
    /// Neither method worked on the first access, and they won't later.
    Unavailable { vmem: Errno, file: Errno },
}

pub struct ProcessMemory {
    pid: Pid,
    style: Option<Style>,
}

impl std::fmt::Debug for ProcessMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match &self.style {
            Some(Style::VirtualMem) => "process_vm_readv",
            Some(Style::File(_)) => "/proc/<pid>/mem",
            Some(Style::Unavailable { vmem, file }) => {
                return write!(f, "process_vm_readv: {vmem}, /proc/<pid>/mem: {file}");
            }
            None => "unknown",
        };

        f.write_str(s)
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory {
    /// A view of the current process; the read method is probed on first
    /// access.
    pub fn new() -> Self {
        Self {
            pid: nix::unistd::getpid(),
            style: None,
        }
    }

    #[doc(hidden)]
    pub fn for_file() -> std::io::Result<Self> {
        let pid = nix::unistd::getpid();
        let file = File::open(format!("/proc/{pid}/mem"))?;
        Ok(Self {
            pid,
            style: Some(Style::File(file)),
        })
    }

    pub fn read(&mut self, src: u64, dst: &mut [u8]) -> Result<usize, ReadMemoryError> {
        if let Some(style) = &mut self.style {
            let res = match style {
                Style::VirtualMem => Self::vmem(self.pid, src, dst),
                Style::File(file) => Self::file(file, src, dst),
                Style::Unavailable { file, .. } => Err(*file),
            };

            return res.map_err(|source| self.error(src, dst.len(), source));
        }

        // Attempt to read in order of speed
        let vmem = match Self::vmem(self.pid, src, dst) {
            Ok(len) => {
                self.style = Some(Style::VirtualMem);
                return Ok(len);
            }
            // The method works, the address is just bad.
            Err(Errno::EFAULT) => {
                self.style = Some(Style::VirtualMem);
                return Err(self.error(src, dst.len(), Errno::EFAULT));
            }
            Err(err) => err,
        };

        let file = match File::open(format!("/proc/{}/mem", self.pid)) {
            Ok(mut file) => match Self::file(&mut file, src, dst) {
                Ok(len) => {
                    self.style = Some(Style::File(file));
                    return Ok(len);
                }
                Err(Errno::EIO) => {
                    self.style = Some(Style::File(file));
                    return Err(self.error(src, dst.len(), Errno::EIO));
                }
                Err(err) => err,
            },
            Err(err) => err
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EACCES),
        };

        log::debug!("No method to read process memory (process_vm_readv: {vmem}, /proc/<pid>/mem: {file})");
        self.style = Some(Style::Unavailable { vmem, file });
        Err(self.error(src, dst.len(), file))
    }

    fn error(&self, address: u64, length: usize, source: Errno) -> ReadMemoryError {
        ReadMemoryError {
            pid: self.pid.as_raw(),
            address,
            offset: 0,
            length,
            source,
        }
    }

    #[inline]
    fn vmem(pid: Pid, src: u64, dst: &mut [u8]) -> Result<usize, Errno> {
        let remote = &[RemoteIoVec {
            base: usize::try_from(src).map_err(|_| Errno::EFAULT)?,
            len: dst.len(),
        }];
        process_vm_readv(pid, &mut [IoSliceMut::new(dst)], remote)
    }

    #[inline]
    fn file(file: &mut File, src: u64, dst: &mut [u8]) -> Result<usize, Errno> {
        file.read_at(dst, src).map_err(|err| {
            err.raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO)
        })
    }
}

impl MemoryView for ProcessMemory {
    fn read(&mut self, address: u64, dst: &mut [u8]) -> Result<usize, ReadMemoryError> {
        ProcessMemory::read(self, address, dst)
    }
}
