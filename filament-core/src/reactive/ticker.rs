//! Tickers: manual propagation pacing.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use crate::reactive::engine::{Engine, EngineCore};

/// A handle that holds back propagation until explicitly ticked.
///
/// While any ticker is alive, atom writes outside a transaction accumulate
/// instead of notifying reactions; [`tick`](Self::tick) flushes everything
/// accumulated so far as one combined cycle. Releasing (or dropping) the
/// last ticker flushes whatever is still pending and restores immediate
/// propagation. Obtained from [`Engine::ticker`].
pub struct Ticker {
    core: Weak<RefCell<EngineCore>>,
    released: Cell<bool>,
}

impl Ticker {
    pub(crate) fn new(core: Weak<RefCell<EngineCore>>) -> Self {
        Self {
            core,
            released: Cell::new(false),
        }
    }

    /// Propagate every write accumulated since the last tick as one
    /// combined cycle. A tick with nothing pending does nothing.
    pub fn tick(&self) {
        if self.released.get() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            Engine::from_core(core).flush_pending();
        }
    }

    /// Give up this ticker. When it is the last one, pending writes are
    /// flushed and writes propagate immediately again. Releasing twice is
    /// a no-op; dropping releases implicitly.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            Engine::from_core(core).release_ticker();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("released", &self.released.get())
            .finish()
    }
}
