use std::{sync::atomic::AtomicU16, time::Duration};

static NEXT_PORT: AtomicU16 = AtomicU16::new(45555);
pub fn get_port() -> u16 {
    let port = NEXT_PORT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if port == 0 {
        panic!("No more ports available");
    }
    port
}

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn init_logger() {
    use tracing_subscriber::layer::SubscriberExt;
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::fmt::layer().with_test_writer());
    // Every test calls this, only the first one wins.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Polls `condition` for about a second while the runtime delivers datagrams.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
