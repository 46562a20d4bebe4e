use std::time::Duration;

use charles_operator::WorkQueue;

#[tokio::test]
async fn test_duplicate_adds_collapse() {
    let queue: WorkQueue<String> = WorkQueue::new();
    queue.add("ns/app1".to_string());
    queue.add("ns/app1".to_string());
    queue.add("ns/app1".to_string());
    queue.add("ns/app2".to_string());

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.next().await.as_deref(), Some("ns/app1"));
    assert_eq!(queue.next().await.as_deref(), Some("ns/app2"));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_key_added_while_processing_is_redelivered_after_done() {
    let queue: WorkQueue<String> = WorkQueue::new();
    queue.add("ns/app1".to_string());

    let key = queue.next().await.unwrap();
    queue.add(key.clone());
    queue.add(key.clone());
    assert!(queue.is_empty(), "in-flight key must not be handed out twice");

    queue.done(&key);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.next().await, Some(key.clone()));
    queue.done(&key);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_waiting_consumer_is_woken_by_add() {
    let queue: WorkQueue<String> = WorkQueue::new();
    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.add("ns/app1".to_string());

    let key = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key.as_deref(), Some("ns/app1"));
}

#[tokio::test]
async fn test_retry_is_delayed_and_counted() {
    let queue: WorkQueue<String> = WorkQueue::with_backoff(Duration::from_millis(30), Duration::from_secs(1));
    queue.add("ns/app1".to_string());
    let key = queue.next().await.unwrap();

    queue.retry(key.clone());
    queue.done(&key);
    assert_eq!(queue.num_requeues(&key), 1);
    assert!(queue.is_empty(), "retry must wait for its backoff");

    let again = tokio::time::timeout(Duration::from_secs(1), queue.next())
        .await
        .unwrap();
    assert_eq!(again, Some(key.clone()));

    queue.retry(key.clone());
    assert_eq!(queue.num_requeues(&key), 2);
    queue.forget(&key);
    assert_eq!(queue.num_requeues(&key), 0);
    queue.done(&key);
}

#[tokio::test]
async fn test_shutdown_releases_waiting_consumers() {
    let queue: WorkQueue<String> = WorkQueue::new();
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shut_down();

    for consumer in consumers {
        let key = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(key.is_none());
    }

    queue.add("ns/app1".to_string());
    assert!(queue.is_empty());
    assert!(queue.is_shutting_down());
}
