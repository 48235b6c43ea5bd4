//! Thread attribute objects.
//!
//! Attributes are copied into the thread descriptor at creation; the
//! attribute object itself can be reused or destroyed afterwards.
//! Destroying poisons the object so later use reports `EINVAL`.

use crate::errno;
use crate::thread::{CREATE_DETACHED, CREATE_JOINABLE};

/// Smallest stack a thread may request.
pub const STACK_MIN: usize = 16 * 1024;

/// Default thread stack size: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default scheduling priority (host-neutral midpoint).
pub const PRIORITY_NORMAL: i32 = 0;

/// Creation-time thread attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttr {
    valid: bool,
    stack_size: usize,
    detach_state: i32,
    priority: i32,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadAttr {
    pub fn new() -> Self {
        Self {
            valid: true,
            stack_size: DEFAULT_STACK_SIZE,
            detach_state: CREATE_JOINABLE,
            priority: PRIORITY_NORMAL,
        }
    }

    fn check(&self) -> i32 {
        if self.valid { 0 } else { errno::EINVAL }
    }

    /// Poison the object. Later accessors report `EINVAL`.
    pub fn destroy(&mut self) -> i32 {
        let rc = self.check();
        if rc == 0 {
            self.valid = false;
        }
        rc
    }

    pub fn set_detach_state(&mut self, state: i32) -> i32 {
        let rc = self.check();
        if rc != 0 {
            return rc;
        }
        if state != CREATE_JOINABLE && state != CREATE_DETACHED {
            return errno::EINVAL;
        }
        self.detach_state = state;
        0
    }

    pub fn detach_state(&self) -> Result<i32, i32> {
        match self.check() {
            0 => Ok(self.detach_state),
            rc => Err(rc),
        }
    }

    pub fn set_stack_size(&mut self, size: usize) -> i32 {
        let rc = self.check();
        if rc != 0 {
            return rc;
        }
        if size < STACK_MIN {
            return errno::EINVAL;
        }
        self.stack_size = size;
        0
    }

    pub fn stack_size(&self) -> Result<usize, i32> {
        match self.check() {
            0 => Ok(self.stack_size),
            rc => Err(rc),
        }
    }

    /// Stack placement is not supported on this host; the contract is
    /// pinned to `ENOTSUP` regardless of future host capabilities.
    pub fn set_stack_addr(&mut self, _addr: usize) -> i32 {
        match self.check() {
            0 => errno::ENOTSUP,
            rc => rc,
        }
    }

    pub fn stack_addr(&self) -> Result<usize, i32> {
        match self.check() {
            0 => Err(errno::ENOTSUP),
            rc => Err(rc),
        }
    }

    pub fn set_priority(&mut self, priority: i32) -> i32 {
        let rc = self.check();
        if rc != 0 {
            return rc;
        }
        self.priority = priority;
        0
    }

    pub fn priority(&self) -> Result<i32, i32> {
        match self.check() {
            0 => Ok(self.priority),
            rc => Err(rc),
        }
    }
}
