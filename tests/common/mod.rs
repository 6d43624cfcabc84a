// tests/common/mod.rs

#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mom_bus::Message;

/// A unit of work whose handler sleeps for `cost_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
    pub cost_secs: u64,
}

impl Job {
    pub fn cost(&self) -> Duration {
        Duration::from_secs(self.cost_secs)
    }
}

impl Message for Job {
    fn type_name() -> std::borrow::Cow<'static, str> {
        "tests.Job".into()
    }
}

/// Let spawned dispatch loops run until `done` holds.
///
/// Yields first; sync handlers run on the blocking pool, so after that it
/// polls every millisecond for up to five seconds.
pub async fn settle_until(mut done: impl FnMut() -> bool) {
    // ---
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    for _ in 0..5_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
