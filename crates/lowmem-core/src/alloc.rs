//! Per-thread accounting of live tensor storage.
//!
//! Every CPU buffer created by [`Storage`](crate::Storage) is counted here
//! when allocated and released when dropped. The counters are thread local,
//! so a test observing a load on its own thread is not disturbed by other
//! tests running concurrently.

use std::cell::Cell;

thread_local! {
    static LIVE: Cell<usize> = const { Cell::new(0) };
    static PEAK: Cell<usize> = const { Cell::new(0) };
}

/// Bytes of tensor storage currently alive on this thread.
pub fn live_bytes() -> usize {
    LIVE.with(|c| c.get())
}

/// Highest value `live_bytes` reached since the last [`reset_peak`].
pub fn peak_bytes() -> usize {
    PEAK.with(|c| c.get())
}

/// Reset the high-water mark to the current live byte count.
pub fn reset_peak() {
    let live = live_bytes();
    PEAK.with(|c| c.set(live));
}

pub(crate) fn record_alloc(nbytes: usize) {
    let live = LIVE.with(|c| {
        let v = c.get() + nbytes;
        c.set(v);
        v
    });
    PEAK.with(|c| {
        if live > c.get() {
            c.set(live);
        }
    });
}

pub(crate) fn record_free(nbytes: usize) {
    // Buffers dropped on another thread than the one that allocated them
    // would underflow; clamp instead.
    LIVE.with(|c| c.set(c.get().saturating_sub(nbytes)));
}
