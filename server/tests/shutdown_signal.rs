#![cfg(unix)]

use clickrank_server::cancel_on_signal;
use std::process::Command;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sigterm_cancels_the_shutdown_token() {
    let shutdown = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(shutdown.clone()));
    // let the watcher install its handlers before the signal arrives
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!shutdown.is_cancelled());

    let status = Command::new("kill").args(["-TERM", &std::process::id().to_string()]).status().unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(10), shutdown.cancelled()).await.unwrap();
    watcher.await.unwrap();
}
