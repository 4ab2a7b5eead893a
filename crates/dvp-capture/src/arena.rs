//! Session arena
//!
//! Tick sources address capture devices by [`SessionHandle`]. A handle
//! carries the generation of the slot it was issued for, so a handle that
//! outlives its device is rejected instead of reaching whichever device
//! reused the slot.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::CaptureDevice;

/// Opaque reference to an arena entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot storage
#[derive(Debug)]
pub struct SessionArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Default for SessionArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionArena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store `value`, reusing a vacated slot if there is one
    pub fn insert(&mut self, value: T) -> SessionHandle {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return SessionHandle {
                index,
                generation: entry.generation,
            };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        SessionHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    /// Take the value out and invalidate every handle to its slot
    pub fn remove(&mut self, handle: SessionHandle) -> Option<T> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capture devices reachable from tick sources
#[derive(Default)]
pub struct CaptureRegistry {
    arena: RwLock<SessionArena<Arc<CaptureDevice>>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Arc<CaptureDevice>) -> SessionHandle {
        let handle = self.arena.write().insert(device);
        debug!("Capture device registered as {}", handle);
        handle
    }

    pub fn unregister(&self, handle: SessionHandle) -> Option<Arc<CaptureDevice>> {
        self.arena.write().remove(handle)
    }

    pub fn device(&self, handle: SessionHandle) -> Option<Arc<CaptureDevice>> {
        self.arena.read().get(handle).cloned()
    }

    /// Deliver a source tick. Returns false, doing nothing, for a stale
    /// handle.
    pub fn dispatch_tick(&self, handle: SessionHandle, now_us: u64) -> bool {
        let Some(device) = self.device(handle) else {
            debug!("Tick for stale session {} ignored", handle);
            return false;
        };
        device.on_tick(now_us);
        true
    }

    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().is_empty()
    }
}
