// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common helpers for the chainproxy integration tests.

use std::net::SocketAddr;
use std::sync::Arc;

use chainproxy::config::{FileConfigProvider, FileFormat};
use chainproxy::{FilterRegistry, ProxyError, ProxyLoader};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A proxy served on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ProxyError>>,
}

#[allow(dead_code)]
impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for the server to drain.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle
            .await
            .expect("server task panicked")
            .expect("server failed");
    }
}

/// A loader reading `config` with a private filter registry.
pub fn loader(config: Value) -> ProxyLoader {
    let provider = FileConfigProvider::from_content(&config.to_string(), FileFormat::Json)
        .expect("test config must be a JSON object");
    ProxyLoader::new()
        .with_provider(provider)
        .with_registry(Arc::new(FilterRegistry::with_builtins()))
}

/// Build the proxy and serve it until [`TestProxy::shutdown`].
pub async fn serve(loader: ProxyLoader) -> TestProxy {
    let chain = loader.build().expect("proxy should build");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let server = chain.server().clone();
    let handle = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
    });

    TestProxy { addr, stop, handle }
}

/// Read an HTTP head off a raw connection.
#[allow(dead_code)]
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Encode `data` as one chunk of a chunked HTTP/1.1 body.
#[allow(dead_code)]
pub fn chunk(data: &str) -> String {
    format!("{:x}\r\n{}\r\n", data.len(), data)
}
