use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

/// Runtime shared by all pipeline streams and their object store I/O.
pub static TOKIO: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .thread_name_fn(|| {
            use std::sync::atomic::{AtomicUsize, Ordering};
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("smartcity-tokio-{}", id)
        })
        .enable_all()
        .build()
        .expect("failed to start the tokio runtime")
});
