//! Expiring exclusive holds on swaps and vaults.
//!
//! A hold is represented by a [`LockToken`]. Expiry only protects against a
//! holder that crashed or hung; a token whose hold expired is no longer
//! valid and must not be used to commit side effects.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{SwapError, SwapResult};

#[derive(Debug, Default)]
struct LockSlot {
    holder: Option<Hold>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    id: u64,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct EntityLock {
    slot: Arc<Mutex<LockSlot>>,
}

impl fmt::Debug for EntityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLock")
            .field("held", &self.is_locked())
            .finish()
    }
}

impl EntityLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` while another unexpired hold exists.
    pub fn try_lock(&self, max_duration: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let mut slot = self.slot.lock().expect("lock slot mutex poisoned");
        if let Some(hold) = slot.holder
            && hold.expires_at > now
        {
            return None;
        }

        slot.next_id += 1;
        let hold = Hold {
            id: slot.next_id,
            expires_at: now + max_duration,
        };
        slot.holder = Some(hold);

        Some(LockToken {
            slot: self.slot.clone(),
            id: hold.id,
            expires_at: hold.expires_at,
        })
    }

    pub fn is_locked(&self) -> bool {
        let slot = self.slot.lock().expect("lock slot mutex poisoned");
        slot.holder.is_some_and(|h| h.expires_at > Instant::now())
    }
}

#[derive(Debug)]
pub struct LockToken {
    slot: Arc<Mutex<LockSlot>>,
    id: u64,
    expires_at: Instant,
}

impl LockToken {
    /// Still the current holder and not expired.
    pub fn is_valid(&self) -> bool {
        if Instant::now() >= self.expires_at {
            return false;
        }
        let slot = self.slot.lock().expect("lock slot mutex poisoned");
        slot.holder.is_some_and(|h| h.id == self.id)
    }

    pub fn ensure_valid(&self) -> SwapResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SwapError::try_again("lock expired before the action completed"))
        }
    }

    pub fn release(&self) {
        let mut slot = self.slot.lock().expect("lock slot mutex poisoned");
        if slot.holder.is_some_and(|h| h.id == self.id) {
            slot.holder = None;
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release();
    }
}
