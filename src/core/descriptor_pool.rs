use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::errors::*;

struct PoolState {
    free: Vec<File>,
    open: usize,
    closed: bool,
}

/// Bounded pool of read/write handles on the page file.
///
/// Handles are opened on demand up to `max_size`; after that callers wait
/// until one is returned.
pub struct DescriptorPool {
    path: PathBuf,
    state: Mutex<PoolState>,
    released: Condvar,
    max_size: usize,
    timeout: Option<Duration>,
}

impl DescriptorPool {
    pub fn new(path: &Path, max_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                open: 0,
                closed: true,
            }),
            released: Condvar::new(),
            max_size: max_size.max(1),
            timeout,
        }
    }

    pub fn reopen(&self) {
        let mut state = self.state.lock().recover_poison();
        state.closed = false;
    }

    pub fn get(&self) -> Result<Descriptor<'_>> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().recover_poison();

        loop {
            if state.closed {
                return Err(Error::FileClosed);
            }

            if let Some(file) = state.free.pop() {
                return Ok(Descriptor {
                    pool: self,
                    file: Some(file),
                });
            }

            if state.open < self.max_size {
                let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
                state.open += 1;
                return Ok(Descriptor {
                    pool: self,
                    file: Some(file),
                });
            }

            state = match deadline {
                None => self.released.wait(state).recover_poison(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::DescriptorTimeout);
                    }
                    self.released.wait_timeout(state, deadline - now).recover_poison().0
                }
            };
        }
    }

    fn put(&self, file: File) {
        let mut state = self.state.lock().recover_poison();
        if state.closed {
            state.open = state.open.saturating_sub(1);
        } else {
            state.free.push(file);
        }
        drop(state);
        self.released.notify_one();
    }

    /// Stops handing out descriptors and closes the idle ones, waiting up to
    /// `attempts * interval` for borrowed handles to come back.
    pub fn close(&self, attempts: u32, interval: Duration) {
        let mut state = self.state.lock().recover_poison();
        let mut tries = 0;

        while state.free.len() < state.open && tries < attempts {
            tries += 1;
            state = self.released.wait_timeout(state, interval).recover_poison().0;
        }

        let in_use = state.open - state.free.len().min(state.open);
        if in_use > 0 {
            warn!(
                path = %self.path.display(),
                in_use,
                "closing page file while descriptors are still in use"
            );
        }

        let idle = state.free.len();
        state.free.clear();
        state.open = in_use;
        state.closed = true;
        drop(state);
        self.released.notify_all();

        debug!(path = %self.path.display(), closed = idle, "descriptor pool closed");
    }

    /// Number of handles currently open, borrowed or idle.
    pub fn open_count(&self) -> usize {
        self.state.lock().recover_poison().open
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().recover_poison().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

/// A borrowed file handle, returned to the pool on drop.
pub struct Descriptor<'a> {
    pool: &'a DescriptorPool,
    file: Option<File>,
}

impl Deref for Descriptor<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        // Only `drop` takes the file out.
        self.file.as_ref().unwrap_or_else(|| unreachable!("descriptor used after release"))
    }
}

impl DerefMut for Descriptor<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().unwrap_or_else(|| unreachable!("descriptor used after release"))
    }
}

impl Drop for Descriptor<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.put(file);
        }
    }
}
