use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::ShmemConfig;
use crate::lifecycle::AttachRetry;


static SHMEM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn unique_name(prefix: &str) -> String {
    format!(
        "lt-{}-{}-{}",
        prefix,
        process::id(),
        SHMEM_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub(crate) fn test_config(prefix: &str) -> ShmemConfig {
    ShmemConfig::builder()
        .name(unique_name(prefix))
        .attach(AttachRetry {
            max_attempts: 500,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
        })
        .build()
        .expect("valid test config")
}
