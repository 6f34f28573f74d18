//! Exercises `RedisDriver` against a real Redis instance.
//!
//! Gated behind `REDIS_URL` so it never runs in a plain `cargo test`; set
//! the env var (e.g. `redis://127.0.0.1:6379`) and drop `--ignored` to run
//! it locally or in CI with a Redis service container.

#![cfg(feature = "redis-driver")]

use std::time::Duration;

use asynctasq_core::driver::Driver;
use asynctasq_drivers::RedisDriver;

async fn connect() -> Option<RedisDriver> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("skipping: REDIS_URL is not set");
        return None;
    };
    match RedisDriver::connect_url(&url, Duration::from_secs(30)).await {
        Ok(driver) => Some(driver),
        Err(err) => {
            eprintln!("skipping: could not connect to redis at {url}: {err}");
            None
        }
    }
}

fn unique_queue(label: &str) -> String {
    format!("asynctasq-test-{label}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn enqueue_fetch_ack_cycle() {
    let Some(driver) = connect().await else { return };
    driver.connect().await.expect("connect");

    let queue = unique_queue("ack");
    let queues = vec![queue.clone()];
    let payload = b"hello-redis".to_vec();

    driver
        .enqueue(&queue, payload.clone(), Duration::from_secs(0))
        .await
        .expect("enqueue");

    let delivered = driver
        .fetch(&queues, 10, Duration::from_secs(1))
        .await
        .expect("fetch");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope_bytes, payload);
    assert_eq!(delivered[0].delivery_attempt, 1);

    driver.ack(&delivered[0].handle).await.expect("ack");

    let empty = driver
        .fetch(&queues, 10, Duration::from_secs(1))
        .await
        .expect("fetch after ack");
    assert!(empty.is_empty());

    driver.close().await;
}

#[tokio::test]
#[ignore]
async fn nack_makes_the_item_visible_again() {
    let Some(driver) = connect().await else { return };
    driver.connect().await.expect("connect");

    let queue = unique_queue("nack");
    let queues = vec![queue.clone()];
    driver
        .enqueue(&queue, b"retry-me".to_vec(), Duration::from_secs(0))
        .await
        .expect("enqueue");

    let first = driver.fetch(&queues, 10, Duration::from_secs(1)).await.expect("fetch");
    assert_eq!(first.len(), 1);

    driver
        .nack(&first[0].handle, b"retry-me", None)
        .await
        .expect("nack");

    let second = driver.fetch(&queues, 10, Duration::from_secs(1)).await.expect("re-fetch");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].envelope_bytes, b"retry-me".to_vec());

    driver.ack(&second[0].handle).await.expect("ack");
    driver.close().await;
}

#[tokio::test]
#[ignore]
async fn dead_lettered_items_are_not_redelivered() {
    let Some(driver) = connect().await else { return };
    driver.connect().await.expect("connect");

    let queue = unique_queue("dlq");
    let queues = vec![queue.clone()];
    driver
        .enqueue(&queue, b"doomed".to_vec(), Duration::from_secs(0))
        .await
        .expect("enqueue");

    let delivered = driver.fetch(&queues, 10, Duration::from_secs(1)).await.expect("fetch");
    assert_eq!(delivered.len(), 1);

    driver
        .dead_letter(&delivered[0].handle, "exceeded max attempts")
        .await
        .expect("dead_letter");

    let empty = driver.fetch(&queues, 10, Duration::from_secs(1)).await.expect("fetch after dlq");
    assert!(empty.is_empty());

    driver.close().await;
}
