use std::time::Duration;

use it_notifier::config::AppConfig;
use it_notifier::env::apply_overrides;
use it_notifier::rabbitmq::{Credentials, HandlerError, HandlerResult, RabbitMQError, ReconnectPolicy};
use it_notifier::{ClientSettings, RabbitClient};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn live_client() -> RabbitClient {
    let mut config = AppConfig::default();
    apply_overrides(&mut config).expect("invalid RABBITMQ_* environment");
    RabbitClient::new(config.credentials(), config.client_settings()).expect("invalid credentials")
}

fn test_queue(label: &str) -> String {
    format!("it-notifier-test-{}-{}", label, uuid::Uuid::new_v4())
}

/// Forwards bodies to `tx`, failing the first `failures` deliveries.
fn recording_handler(
    tx: mpsc::UnboundedSender<Vec<u8>>,
    failures: u32,
) -> impl Fn(Vec<u8>) -> std::future::Ready<HandlerResult> + Send + Sync {
    let remaining = std::sync::atomic::AtomicU32::new(failures);
    move |body| {
        let _ = tx.send(body);
        let left = remaining.load(std::sync::atomic::Ordering::SeqCst);
        if left > 0 {
            remaining.store(left - 1, std::sync::atomic::Ordering::SeqCst);
            return std::future::ready(Err(HandlerError::Retry(anyhow::anyhow!("try again"))));
        }
        std::future::ready(Ok(()))
    }
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_publish_then_consume_delivers_once() {
    let client = live_client();
    let queue = test_queue("roundtrip");
    client.publish(&queue, b"hello").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let consumer = {
        let client = client.clone();
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client
                .consume_until(&queue, &recording_handler(tx, 0), &cancel)
                .await
        })
    };

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(b"hello".to_vec()));
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_err());

    cancel.cancel();
    let stats = consumer.await.unwrap().unwrap();
    assert_eq!(stats.acked, 1);
    client.shutdown().await;
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_failed_handler_gets_message_again() {
    let client = live_client();
    let queue = test_queue("requeue");
    client.publish(&queue, b"flaky").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = {
        let client = client.clone();
        let queue = queue.clone();
        tokio::spawn(async move { client.consume(&queue, &recording_handler(tx, 1)).await })
    };

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(b"flaky".to_vec()));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(b"flaky".to_vec()));

    client.shutdown().await;
    let stats = consumer.await.unwrap().unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_queues_do_not_share_messages() {
    let client = live_client();
    let (a, b) = (test_queue("a"), test_queue("b"));
    client.publish(&a, b"for a").await.unwrap();
    client.publish(&b, b"for b").await.unwrap();
    // Redeclaring with the same arguments must be harmless.
    client.publish(&a, b"again for a").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = {
        let client = client.clone();
        let b = b.clone();
        tokio::spawn(async move { client.consume(&b, &recording_handler(tx, 0)).await })
    };

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(b"for b".to_vec()));
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_err());

    client.shutdown().await;
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_unreachable_broker_exhausts_attempts() {
    let settings = ClientSettings {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_publish_attempts: Some(2),
            ..ReconnectPolicy::default()
        },
        ..ClientSettings::default()
    };
    // Nothing listens on the discard port.
    let client = RabbitClient::new(Credentials::anonymous("127.0.0.1", 9), settings).unwrap();

    let cancel = client.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.shutdown().await;
    });

    let result = client.publish("unreachable", b"x").await;
    watchdog.abort();
    assert!(matches!(
        result,
        Err(RabbitMQError::RetriesExhausted { .. }) | Err(RabbitMQError::Cancelled)
    ));
}
