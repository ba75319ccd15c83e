use std::time::Duration;

use stratumdb::config::Config;
use stratumdb::doc;
use stratumdb::protocol::read_message;
use stratumdb::types::Document;
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;
use client::{rand_suffix, send_command, spawn_server};

#[tokio::test]
async fn e2e_shutdown_drains_connections_and_closes_registry() {
    let server = spawn_server(Config {
        shutdown_grace_secs: Some(2),
        ..Config::default()
    })
    .await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let dbname = format!("shut_{}", rand_suffix(6));

    // Leave a live cursor behind.
    let docs: Vec<Document> = (0..10).map(|i| doc! {"i": i}).collect();
    send_command(
        &mut stream,
        &doc! {"insert": "u", "documents": docs, "$db": &dbname},
        1,
    )
    .await;
    let reply = send_command(
        &mut stream,
        &doc! {"find": "u", "filter": doc! {}, "batchSize": 2i32, "$db": &dbname},
        2,
    )
    .await;
    let id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    assert_ne!(id, 0);
    assert_eq!(server.handler.cursors().live_count(), 1);

    server.shutdown.signal();

    // The idle connection is cancelled and closed.
    let end = tokio::time::timeout(Duration::from_secs(5), read_message(&mut stream)).await;
    match end {
        Ok(Ok(None)) | Ok(Err(_)) => {}
        other => panic!("expected the server to close the connection, got {other:?}"),
    }

    // Registry drained and sealed.
    for _ in 0..50 {
        if server.handler.cursors().live_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.handler.cursors().live_count(), 0);
    assert!(
        server
            .handler
            .cursors()
            .register("db", "c", None, stratumdb::cursor::stream_from_batch(vec![]))
            .is_err()
    );

    // New connections are refused once the listener is gone.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(server.addr).await.is_err());
}
