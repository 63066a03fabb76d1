//! Loopback callback listener tests over real sockets

use std::sync::Arc;
use std::time::Duration;

use gatehouse::auth::callback::{CallbackListener, CallbackResult};
use gatehouse::error::FlowError;

fn callback_url(listener: &CallbackListener, query: &str) -> String {
    format!("http://127.0.0.1:{}/callback?{}", listener.port(), query)
}

#[tokio::test]
async fn test_code_and_state_are_delivered() {
    let listener = CallbackListener::start(0).await.unwrap();

    let resp = reqwest::get(callback_url(&listener, "code=XYZ&state=abc123"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("return to the terminal"));

    let params = listener
        .wait_for_callback(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(params.code, "XYZ");
    assert_eq!(params.state.as_deref(), Some("abc123"));

    listener.stop().await;
}

#[tokio::test]
async fn test_second_callback_does_not_overwrite_first() {
    let listener = CallbackListener::start(0).await.unwrap();

    reqwest::get(callback_url(&listener, "code=XYZ&state=abc123"))
        .await
        .unwrap();
    let late = reqwest::get(callback_url(&listener, "code=OTHER&state=abc123"))
        .await
        .unwrap();
    assert!(late.status().is_success());

    let params = listener
        .wait_for_callback(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(params.code, "XYZ");

    listener.stop().await;
}

#[tokio::test]
async fn test_wait_started_before_arrival_is_woken() {
    let listener = Arc::new(CallbackListener::start(0).await.unwrap());
    let url = callback_url(&listener, "code=LATE&state=s");

    let waiter = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.wait_for_callback(Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    reqwest::get(url).await.unwrap();

    let params = waiter.await.unwrap().unwrap();
    assert_eq!(params.code, "LATE");
    listener.stop().await;
}

#[tokio::test]
async fn test_error_callback_returns_400_and_callback_error() {
    let listener = CallbackListener::start(0).await.unwrap();

    let resp = reqwest::get(callback_url(&listener, "error=access_denied&state=s"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let err = listener
        .wait_for_callback(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, FlowError::CallbackError("access_denied".to_string()));
    assert!(matches!(
        listener.result(),
        Some(CallbackResult::Failed { ref error, .. }) if error == "access_denied"
    ));

    listener.stop().await;
}

#[tokio::test]
async fn test_other_paths_return_404() {
    let listener = CallbackListener::start(0).await.unwrap();

    let resp = reqwest::get(format!("http://127.0.0.1:{}/favicon.ico", listener.port()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(listener.result().is_none());

    listener.stop().await;
}

#[tokio::test]
async fn test_callback_without_code_or_error_returns_404() {
    let listener = CallbackListener::start(0).await.unwrap();

    let resp = reqwest::get(callback_url(&listener, "state=abc123"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(listener.result().is_none());

    listener.stop().await;
}

#[tokio::test]
async fn test_timeout_without_callback() {
    let listener = CallbackListener::start(0).await.unwrap();

    let err = listener
        .wait_for_callback(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::CallbackTimeout { .. }));

    listener.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_releases_port() {
    let listener = CallbackListener::start(0).await.unwrap();
    let port = listener.port();

    listener.stop().await;
    listener.stop().await;
    assert!(listener.is_stopped());

    let again = CallbackListener::start(port).await.unwrap();
    again.stop().await;
}

#[tokio::test]
async fn test_concurrent_stop_calls_do_not_hang() {
    let listener = Arc::new(CallbackListener::start(0).await.unwrap());

    let stops: Vec<_> = (0..4)
        .map(|_| {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.stop().await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(stops))
        .await
        .expect("stop calls finished");
    assert!(listener.is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_releases_port_before_returning() {
    let mut port = CallbackListener::start(0).await.unwrap().port();

    for _ in 0..20 {
        let listener = CallbackListener::start(port).await.unwrap();
        reqwest::get(callback_url(&listener, "code=XYZ&state=s"))
            .await
            .unwrap();
        drop(listener);

        let again = CallbackListener::start(port).await.unwrap();
        port = again.port();
        drop(again);
    }
}
