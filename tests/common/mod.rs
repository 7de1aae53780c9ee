#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

/// Poll `predicate` until it holds or `timeout` passes. Returns the last result.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

pub const SETTLE: Duration = Duration::from_secs(2);
