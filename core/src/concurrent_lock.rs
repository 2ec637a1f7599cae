//! Shared/exclusive coordination for session rotation.
//!
//! Many short operations ("blocks") run concurrently: signing a request,
//! verifying an inbound header. Rotation must run with no block in flight,
//! because it reads and replaces the same secret the blocks are using. A
//! plain rwlock is not enough: a task inside a block must be able to upgrade
//! into the exclusive section without deadlocking against itself, and the
//! exclusive path drains each in-flight block individually.
//!
//! Every blocking task holds a private async lock registered in a shared map
//! keyed by task identity. Registration happens under the exclusive mutex, so
//! a pending `synchronize` stops new blocks from starting; draining then
//! acquires-and-releases each registered private lock, which only succeeds
//! once that task's block has finished.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ContextId {
    Task(tokio::task::Id),
    /// Callers outside any tokio task — a root future driven by `block_on` —
    /// are polled on exactly one thread, so the thread id identifies the
    /// caller and a nested call resolves to the same key.
    Thread(std::thread::ThreadId),
}

struct Holder {
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

pub struct ConcurrentLock {
    exclusive: Mutex<()>,
    holders: SyncMutex<HashMap<ContextId, Holder>>,
}

impl ConcurrentLock {
    pub fn new() -> Self {
        Self {
            exclusive: Mutex::new(()),
            holders: SyncMutex::new(HashMap::new()),
        }
    }

    fn context(&self) -> ContextId {
        match tokio::task::try_id() {
            Some(id) => ContextId::Task(id),
            None => ContextId::Thread(std::thread::current().id()),
        }
    }

    /// Run `f` as a block. Blocks from different tasks run concurrently;
    /// nested calls from the same task run `f` directly.
    pub async fn block<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ctx = self.context();
        if self.holders.lock().contains_key(&ctx) {
            return f().await;
        }

        let lock = Arc::new(Mutex::new(()));
        let guard = lock.clone().lock_owned().await;
        {
            // Registration gate: a pending synchronize holds this mutex, so
            // no new block starts while an exclusive section runs or drains.
            let _exclusive = self.exclusive.lock().await;
            self.holders.lock().insert(
                ctx,
                Holder {
                    lock: lock.clone(),
                    _guard: guard,
                },
            );
        }

        let _unregister = Unregister { owner: self, ctx };
        f().await
    }

    /// Run `f` with no block in flight. If the calling task currently holds a
    /// block, its private lock is released for the duration and restored
    /// afterwards, so upgrading from inside a block does not self-deadlock.
    pub async fn synchronize<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ctx = self.context();
        let own = self
            .holders
            .lock()
            .remove(&ctx)
            .map(|holder| holder.lock.clone());

        let result = {
            let _exclusive = self.exclusive.lock().await;
            loop {
                let pending: Vec<Arc<Mutex<()>>> = self
                    .holders
                    .lock()
                    .values()
                    .map(|holder| holder.lock.clone())
                    .collect();
                if pending.is_empty() {
                    break;
                }
                // Each acquisition completes only once the owning task's
                // block call has finished and dropped its guard.
                for lock in pending {
                    drop(lock.lock().await);
                }
            }
            f().await
        };

        if let Some(lock) = own {
            // Restore our block status exactly as before. Re-registration
            // goes through the gate again so a queued synchronize drains us.
            let guard = lock.clone().lock_owned().await;
            let _exclusive = self.exclusive.lock().await;
            self.holders.lock().insert(
                ctx,
                Holder {
                    lock,
                    _guard: guard,
                },
            );
        }

        result
    }
}

impl Default for ConcurrentLock {
    fn default() -> Self {
        Self::new()
    }
}

struct Unregister<'a> {
    owner: &'a ConcurrentLock,
    ctx: ContextId,
}

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        self.owner.holders.lock().remove(&self.ctx);
    }
}
