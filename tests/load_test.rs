//! Load testing: many echo sessions at once.

use std::time::{Duration, Instant};

use wirelink::{Blacklist, Event};

mod common;
use common::{handshaken_client, local_config, start_server, wait_ready, TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_echo_sessions() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    // Echo every line back to its session.
    let echo = server.notifier().spawn_subscriber(|event| {
        if let Event::DataReceived { session, payload } = event {
            session.send_detached(payload);
        }
    });

    let concurrency = 32;
    let lines_per_client = 50;

    let mut clients = Vec::new();
    for _ in 0..concurrency {
        clients.push(handshaken_client(addr).await);
    }
    wait_ready(&mut events, concurrency).await;
    assert_eq!(server.registry().len(), concurrency);

    let start = Instant::now();
    let tasks: Vec<_> = clients
        .into_iter()
        .enumerate()
        .map(|(c, client)| {
            tokio::spawn(async move {
                for n in 0..lines_per_client {
                    let line = format!("client-{c}-line-{n}");
                    client.write_line(&line).await.unwrap();
                    let echoed = client.read_line_within(Some(TIMEOUT)).await.unwrap();
                    assert_eq!(echoed.as_deref(), Some(line.as_str()));
                }
                client.dispose().await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    let elapsed = start.elapsed();
    let total = concurrency * lines_per_client;
    println!(
        "{total} round trips over {concurrency} sessions in {elapsed:?} ({:.0}/s)",
        total as f64 / elapsed.as_secs_f64()
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.stop().await;
    echo.abort();
}
