//
// Copyright 2024 Jeff Bush
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

// Locks usable with no thread scheduler. A waiter either busy-polls or, when
// a cooperative runtime has registered a yield hook, gives up the CPU between
// attempts. There is no poisoning: a panic inside a critical section releases
// the lock on unwind and leaves the protected value as the panicking code
// left it.

pub use spin::{MutexGuard as SpinMutexGuard, RwLockReadGuard, RwLockWriteGuard};

static YIELD_HOOK: spin::Once<fn()> = spin::Once::new();

/// Install the cooperative yield function used by every blocking wait in the
/// stack. This can only be done once per process. Returns false if a hook
/// was already registered (the existing one is kept).
pub fn register_runtime(yield_now: fn()) -> bool {
    let mut installed = false;
    YIELD_HOOK.call_once(|| {
        installed = true;
        yield_now
    });

    if installed {
        tracing::info!("cooperative runtime registered, waiters will yield");
    }

    installed
}

pub fn runtime_present() -> bool {
    YIELD_HOOK.is_completed()
}

/// Back off once while waiting on a contended resource.
pub fn relax() {
    match YIELD_HOOK.get() {
        Some(yield_now) => yield_now(),
        None => std::hint::spin_loop(),
    }
}

/// Mutual exclusion that never needs a scheduler to make progress.
pub struct SpinMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        SpinMutex {
            inner: spin::Mutex::new(value),
        }
    }

    /// Block until the lock is held. The guard releases it when it goes out
    /// of scope, including during unwinding.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }

            while self.inner.is_locked() {
                relax();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        SpinMutex::new(T::default())
    }
}

/// Readers/writer variant, used where reads dominate (interface
/// configuration, interface table).
pub struct SpinRwLock<T> {
    inner: spin::RwLock<T>,
}

impl<T> SpinRwLock<T> {
    pub const fn new(value: T) -> Self {
        SpinRwLock {
            inner: spin::RwLock::new(value),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_read() {
                return guard;
            }

            relax();
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_write() {
                return guard;
            }

            relax();
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }
}

impl<T: Default> Default for SpinRwLock<T> {
    fn default() -> Self {
        SpinRwLock::new(T::default())
    }
}
