//! Per-connection session state and the session pool
//!
//! Sessions are pooled and fully reset on release. The dispatcher rolls
//! back any open transaction before handing a session back.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::auth::AuthedUser;

#[derive(Debug, Default)]
pub struct Session {
    pub user: Option<AuthedUser>,
    pub tx: Option<Uuid>,
}

impl Session {
    fn reset(&mut self) {
        self.user = None;
        self.tx = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

pub struct SessionPool {
    free: Mutex<Vec<Session>>,
    outstanding: AtomicUsize,
    capacity: usize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Take a session, or `None` when the server is at capacity
    pub fn acquire(&self) -> Option<Session> {
        loop {
            let current = self.outstanding.load(Ordering::Acquire);
            if current >= self.capacity {
                return None;
            }
            if self
                .outstanding
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        Some(self.free.lock().pop().unwrap_or_default())
    }

    /// Return a fully reset session to the pool. The caller has already
    /// settled any open transaction.
    pub fn release(&self, mut session: Session) {
        debug_assert!(session.tx.is_none(), "transaction must be settled before release");
        session.reset();
        self.free.lock().push(session);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced_and_sessions_recycle() {
        let pool = SessionPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.acquire().unwrap();
        assert!(!c.is_authenticated());
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn released_sessions_are_clean() {
        let pool = SessionPool::new(1);
        let mut session = pool.acquire().unwrap();
        session.user = Some(crate::auth::AuthedUser {
            username: "u".into(),
            is_root: false,
            permissions: Default::default(),
            is_loopback: true,
        });
        pool.release(session);

        let again = pool.acquire().unwrap();
        assert!(again.user.is_none());
        assert!(again.tx.is_none());
    }
}
