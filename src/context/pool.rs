//! Reusable [`Context`] storage.
//!
//! Every acquisition resets the context before handing it out. Release
//! resets it too, so an idle context never pins a request body, a response
//! channel or the engine itself.

use std::sync::{Mutex, PoisonError};

use super::Context;

/// Idle contexts kept around. Bursts above this allocate and are dropped.
const MAX_IDLE: usize = 1024;

/// A lock-protected free list of contexts.
#[derive(Default)]
pub struct Pool {
    free: Mutex<Vec<Context>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a clean context. Never fails: an empty pool allocates.
    pub fn acquire(&self) -> Context {
        let reused = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut ctx = reused.unwrap_or_default();
        ctx.reset();
        ctx
    }

    /// Takes a context back once its response has been finalised.
    pub fn release(&self, mut ctx: Context) {
        ctx.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < MAX_IDLE {
            free.push(ctx);
        }
    }

    /// Number of idle contexts.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::StatusCode;
    use tokio::sync::oneshot;

    use super::*;
    use crate::engine::Engine;
    use crate::handler::{BoxFuture, boxed};
    use crate::request::Request;

    fn noop(_c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async {})
    }

    #[test]
    fn acquire_on_empty_pool_allocates() {
        let pool = Pool::new();
        let c = pool.acquire();
        assert_eq!(c.chain_len(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn released_context_comes_back_clean() {
        let pool = Pool::new();
        let engine = Arc::new(Engine::new());

        let (tx, _rx) = oneshot::channel();
        let mut c = pool.acquire();
        c.prepare(Arc::clone(&engine), Request::default(), Arc::new([boxed(noop), boxed(noop)]), tx);
        c.next().await;
        c.string(StatusCode::ACCEPTED, "dirty");
        c.flush();
        c.abort();
        c.set(42u32);
        pool.release(c);
        assert_eq!(pool.idle(), 1);

        let c = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert_eq!(c.chain_len(), 0);
        assert!(!c.is_aborted());
        assert!(!c.writer().written());
        assert!(!c.writer().flushed());
        assert_eq!(c.writer().status(), StatusCode::OK);
        assert!(c.writer().headers().is_empty());
        assert_eq!(c.get::<u32>(), None);
        // The idle context dropped its engine handle.
        assert_eq!(Arc::strong_count(&engine), 1);
    }

    #[test]
    fn concurrent_acquire_and_release() {
        let pool = Arc::new(Pool::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut c = pool.acquire();
                        assert!(!c.writer().written());
                        c.writer_mut().write(b"x");
                        pool.release(c);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}
