/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Default [`StackWalker`], backed by `framehop`.
//!
//! Without any registered module framehop falls back to frame pointer
//! unwinding, which is enough for code built with frame pointers. Modules
//! with their unwind sections can be added for DWARF based unwinding.

use {
    crate::{
        errors::WalkError,
        frames::{Frame, MemoryView, StackWalker, WalkOptions},
        linux::Registers,
    },
    framehop::{CacheNative, MayAllocateDuringUnwind, Module, Unwinder, UnwinderNative},
    std::{ops::Range, sync::Arc},
};

#[derive(Clone)]
struct ModuleRange {
    name: Arc<str>,
    avma_range: Range<u64>,
}

pub struct FramehopWalker {
    unwinder: UnwinderNative<Vec<u8>, MayAllocateDuringUnwind>,
    cache: CacheNative<MayAllocateDuringUnwind>,
    modules: Arc<Vec<ModuleRange>>,
}

/// Clones share the registered modules but start with an empty rule cache.
impl Clone for FramehopWalker {
    fn clone(&self) -> Self {
        Self {
            unwinder: self.unwinder.clone(),
            cache: CacheNative::new(),
            modules: Arc::clone(&self.modules),
        }
    }
}

impl Default for FramehopWalker {
    fn default() -> Self {
        Self::new()
    }
}

impl FramehopWalker {
    pub fn new() -> Self {
        Self {
            unwinder: UnwinderNative::new(),
            cache: CacheNative::new(),
            modules: Arc::new(Vec::new()),
        }
    }

    /// Registers a module so frames inside it unwind with its unwind info
    /// and are attributed to it by name.
    pub fn add_module(&mut self, module: Module<Vec<u8>>) {
        Arc::make_mut(&mut self.modules).push(ModuleRange {
            name: Arc::from(module.name()),
            avma_range: module.avma_range(),
        });
        self.unwinder.add_module(module);
    }
}

fn module_for(modules: &[ModuleRange], address: u64) -> Option<Arc<str>> {
    modules
        .iter()
        .find(|module| module.avma_range.contains(&address))
        .map(|module| module.name.clone())
}

impl StackWalker for FramehopWalker {
    fn walk(
        &mut self,
        regs: &Registers,
        memory: &mut dyn MemoryView,
        options: &WalkOptions,
    ) -> Result<Vec<Frame>, WalkError> {
        let Self {
            unwinder,
            cache,
            modules,
        } = self;
        let mut read_stack = |address: u64| memory.read_u64(address).map_err(drop);
        let mut iter = unwinder.iter_frames(regs.pc(), regs.unwind_regs(), cache, &mut read_stack);

        let mut frames = Vec::new();
        let mut seen = 0usize;
        while frames.len() < options.max_frames {
            let address = match iter.next() {
                Ok(Some(address)) => address,
                Ok(None) => break,
                Err(err) if seen == 0 => return Err(WalkError::Unwinder(err)),
                Err(err) => {
                    log::debug!("Stack truncated after {seen} frames: {err}");
                    break;
                }
            };
            seen += 1;

            let pc = address.address();
            let module = module_for(modules, pc);
            if let Some(name) = &module {
                if options.ignores_module(name) {
                    break;
                }
            }

            if seen <= options.initial_frames_to_skip {
                continue;
            }

            frames.push(Frame {
                num: frames.len(),
                pc,
                is_return_address: address.is_return_address(),
                module,
            });
        }

        Ok(frames)
    }
}
