//! Shared fixtures for integration tests.
#![allow(dead_code)]

pub mod processors;
pub mod socket_guard;

use std::time::Duration;

/// Polls an async condition until it holds, panicking after ~1s.
pub async fn wait_until(mut check: impl AsyncFnMut() -> bool) {
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
