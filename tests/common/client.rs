//! Shared helpers for the e2e suite: spawn a server on an ephemeral port and
//! talk to it over a raw TcpStream with the crate's own codec.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use rand::{Rng, distributions::Alphanumeric};
use tokio::net::TcpStream;

use stratumdb::config::Config;
use stratumdb::handler::Handler;
use stratumdb::protocol::{OpBody, encode_op_msg_doc, read_message};
use stratumdb::server::{ShutdownHandle, spawn_with_shutdown};
use stratumdb::store::memory::MemoryStore;
use stratumdb::types::Document;

pub struct TestServer {
    pub handler: Arc<Handler>,
    pub addr: SocketAddr,
    pub data_api_addr: Option<SocketAddr>,
    pub shutdown: ShutdownHandle,
}

pub async fn spawn_server(mut cfg: Config) -> TestServer {
    cfg.listen_addr = "127.0.0.1:0".into();
    let handler = Handler::new(cfg.handler_config(), Arc::new(MemoryStore::new()));
    let (addr, data_api_addr, shutdown, _handle) = spawn_with_shutdown(cfg, handler.clone())
        .await
        .expect("failed to spawn server");
    TestServer {
        handler,
        addr,
        data_api_addr,
        shutdown,
    }
}

pub fn rand_suffix(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

pub async fn read_reply(stream: &mut TcpStream) -> Document {
    match read_message(stream).await.unwrap().unwrap() {
        (_, OpBody::Msg(msg)) => msg.into_command().unwrap(),
        (_, other) => panic!("expected OP_MSG reply, got {other:?}"),
    }
}

/// Send one command document and read its reply.
pub async fn send_command(
    stream: &mut TcpStream,
    request: &Document,
    request_id: i32,
) -> Document {
    use tokio::io::AsyncWriteExt;
    let bytes = encode_op_msg_doc(request, 0, request_id).unwrap();
    stream.write_all(&bytes).await.unwrap();
    read_reply(stream).await
}
