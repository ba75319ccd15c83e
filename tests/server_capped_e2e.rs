use std::time::Duration;

use stratumdb::config::Config;
use stratumdb::doc;
use stratumdb::types::Document;
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;
use client::{rand_suffix, send_command, spawn_server};

#[tokio::test]
async fn e2e_capped_cleanup_trims_fifo() {
    let server = spawn_server(Config {
        capped_cleanup_interval_secs: Some(1),
        capped_cleanup_percentage: Some(10),
        ..Config::default()
    })
    .await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let dbname = format!("capped_{}", rand_suffix(6));

    let create = doc! {
        "create": "log",
        "capped": true,
        "size": 1_000_000i64,
        "max": 50i64,
        "$db": &dbname,
    };
    let reply = send_command(&mut stream, &create, 1).await;
    assert_eq!(reply.get_f64("ok"), Some(1.0));

    let docs: Vec<Document> = (0..100).map(|i| doc! {"_id": i}).collect();
    let ins = doc! {"insert": "log", "documents": docs, "$db": &dbname};
    let reply = send_command(&mut stream, &ins, 2).await;
    assert_eq!(reply.get_i32("n"), Some(100));

    // Wait for the loop to take at least one pass; each pass removes ten
    // percent of the current count, so the first observation is at most 90.
    let mut count = 100;
    for attempt in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reply =
            send_command(&mut stream, &doc! {"count": "log", "$db": &dbname}, 10 + attempt).await;
        count = reply.get_i32("n").unwrap();
        if count < 100 {
            break;
        }
    }
    assert!(count <= 90, "cleanup never ran, count={count}");

    // The oldest documents went first.
    let cnt = doc! {"count": "log", "query": doc! {"_id": doc! {"$lt": 10i32}}, "$db": &dbname};
    let reply = send_command(&mut stream, &cnt, 60).await;
    assert_eq!(reply.get_i32("n"), Some(0));

    server.shutdown.signal();
}

#[tokio::test]
async fn e2e_capped_metadata_visible_in_list_collections() {
    let server = spawn_server(Config::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let dbname = format!("cmeta_{}", rand_suffix(6));

    let create = doc! {
        "create": "log",
        "capped": true,
        "size": 4096i64,
        "max": 10i64,
        "$db": &dbname,
    };
    send_command(&mut stream, &create, 1).await;

    let reply = send_command(&mut stream, &doc! {"listCollections": 1i32, "$db": &dbname}, 2).await;
    let cursor = reply.get_document("cursor").unwrap();
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    let entry = batch[0].as_document().unwrap();
    assert_eq!(entry.get_str("name"), Some("log"));
    let options = entry.get_document("options").unwrap();
    assert_eq!(options.get_bool("capped"), Some(true));
    assert_eq!(options.get_i64("size"), Some(4096));
    assert_eq!(options.get_i64("max"), Some(10));

    server.shutdown.signal();
}

#[tokio::test]
async fn e2e_capped_create_requires_size() {
    let server = spawn_server(Config::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let create = doc! {"create": "log", "capped": true, "$db": "capreq"};
    let reply = send_command(&mut stream, &create, 1).await;
    assert_eq!(reply.get_f64("ok"), Some(0.0));
    assert_eq!(reply.get_str("codeName"), Some("BadValue"));

    server.shutdown.signal();
}
