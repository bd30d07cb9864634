#[cfg(test)]
mod sync_test;

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// A mutex the owning thread may re-acquire. The guard hands out `&T` only;
/// interior mutability (a `RefCell`) provides mutation with short, non-nested
/// borrow scopes.
pub struct ReentrantMutex<T> {
    owner: Mutex<OwnerState>,
    available: Condvar,
    value: UnsafeCell<T>,
}

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: usize,
}

// Only the thread holding the lock can reach the value, so Send on T is
// the whole requirement.
unsafe impl<T: Send> Send for ReentrantMutex<T> {}
unsafe impl<T: Send> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub fn new(value: T) -> Self {
        ReentrantMutex {
            owner: Mutex::new(OwnerState::default()),
            available: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.owner.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self.available.wait(state).unwrap();
                }
            }
        }
        ReentrantMutexGuard { lock: self }
    }
}

pub struct ReentrantMutexGuard<'a, T> {
    lock: &'a ReentrantMutex<T>,
}

impl<T> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.owner.lock().unwrap();
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.lock.available.notify_one();
        }
    }
}

/// A condition variable with a sticky fired flag and parent chaining:
/// broadcasting a condition also broadcasts every ancestor, each visited at
/// most once per broadcast. Composable readiness is built from this. A
/// queue's update condition parents its socket's read condition, which in
/// turn parents a select call's global condition.
pub struct Condition {
    name: String,
    state: Mutex<CondState>,
    cv: Condvar,
}

#[derive(Default)]
struct CondState {
    fired: bool,
    parents: Vec<Weak<Condition>>,
}

impl Condition {
    pub fn new(name: &str) -> Arc<Condition> {
        Arc::new(Condition {
            name: name.to_string(),
            state: Mutex::new(CondState::default()),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches `parent`. If this condition is already fired the parent is
    /// broadcast immediately, so a late-attached waiter does not miss it.
    pub fn add_parent(&self, parent: &Arc<Condition>) {
        let fired = {
            let mut state = self.state.lock().unwrap();
            state.parents.push(Arc::downgrade(parent));
            state.fired
        };
        if fired {
            parent.broadcast();
        }
    }

    pub fn remove_parent(&self, parent: &Arc<Condition>) {
        let target = Arc::downgrade(parent);
        let mut state = self.state.lock().unwrap();
        state.parents.retain(|p| !p.ptr_eq(&target));
    }

    /// Fires the condition and wakes every waiter here and on all ancestors.
    pub fn broadcast(&self) {
        let mut visited = Vec::new();
        self.broadcast_walk(&mut visited);
    }

    /// Same as `broadcast`; kept as the name call sites use for the sticky
    /// set operation.
    pub fn fire(&self) {
        self.broadcast();
    }

    /// Fires the condition but wakes a single local waiter. Ancestors are
    /// still broadcast so composed waits observe the update.
    pub fn signal(&self) {
        let parents = {
            let mut state = self.state.lock().unwrap();
            state.fired = true;
            self.cv.notify_one();
            state.parents.clone()
        };
        let mut visited = vec![self as *const Condition];
        for parent in parents {
            if let Some(parent) = parent.upgrade() {
                parent.broadcast_walk(&mut visited);
            }
        }
    }

    fn broadcast_walk(&self, visited: &mut Vec<*const Condition>) {
        let me = self as *const Condition;
        if visited.contains(&me) {
            return;
        }
        visited.push(me);
        let parents = {
            let mut state = self.state.lock().unwrap();
            state.fired = true;
            self.cv.notify_all();
            state.parents.clone()
        };
        for parent in parents {
            if let Some(parent) = parent.upgrade() {
                parent.broadcast_walk(visited);
            }
        }
    }

    /// Consumes the fired flag.
    pub fn fired(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let was = state.fired;
        state.fired = false;
        was
    }

    /// Reads the fired flag without clearing it.
    pub fn peek_fired(&self) -> bool {
        self.state.lock().unwrap().fired
    }

    /// Waits until fired, without timeout. Consumes the flag.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.fired {
            state = self.cv.wait(state).unwrap();
        }
        state.fired = false;
    }

    /// Waits up to `microseconds`. Returns true when the condition fired,
    /// false on timeout. Consumes the flag on success.
    pub fn timed_wait(&self, microseconds: u64) -> bool {
        let deadline = Instant::now() + Duration::from_micros(microseconds);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.fired {
                state.fired = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _timeout) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("fired", &self.peek_fired())
            .finish()
    }
}
