// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol upgrades (`101 Switching Protocols`).
//!
//! Both sides of an upgraded exchange hand over their raw connection as a
//! [`PendingUpgrade`] stored in the message extensions.  Once the upstream
//! agreed to switch, the engine splices the two connections together.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// A raw bidirectional connection.
pub trait UpgradedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpgradedIo for T {}

pub type BoxedIo = Box<dyn UpgradedIo>;

type UpgradeFuture = BoxFuture<'static, io::Result<BoxedIo>>;

/// A connection that becomes available once the switch completes.
#[derive(Clone)]
pub struct PendingUpgrade(Arc<Mutex<Option<UpgradeFuture>>>);

impl PendingUpgrade {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = io::Result<BoxedIo>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::pin(future)))))
    }

    /// An already established connection.
    pub fn ready(io: BoxedIo) -> Self {
        Self::new(async move { Ok(io) })
    }

    /// Claim the connection.  Only the first caller gets it.
    pub fn take(&self) -> Option<BoxFuture<'static, io::Result<BoxedIo>>> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl fmt::Debug for PendingUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let claimed = self.0.lock().map(|slot| slot.is_none()).unwrap_or(true);
        f.debug_struct("PendingUpgrade")
            .field("claimed", &claimed)
            .finish()
    }
}

/// The client side, inserted into request extensions by the server.
#[derive(Clone, Debug)]
pub struct ClientUpgrade(pub PendingUpgrade);

/// The upstream side, inserted into response extensions by the transport.
#[derive(Clone, Debug)]
pub struct UpstreamUpgrade(pub PendingUpgrade);

/// Copy bytes both ways until either side closes, a copy fails or `cancel`
/// fires.
pub async fn splice(client: BoxedIo, upstream: BoxedIo, cancel: CancellationToken) -> io::Result<()> {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let to_upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    tokio::select! {
        copied = to_upstream => copied.map(|_| ()),
        copied = to_client => copied.map(|_| ()),
        _ = cancel.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pending_upgrade_is_claimed_once() {
        let (a, _b) = tokio::io::duplex(64);
        let pending = PendingUpgrade::ready(Box::new(a));
        let copy = pending.clone();

        assert!(pending.take().is_some());
        assert!(copy.take().is_none());
    }

    #[tokio::test]
    async fn test_splice_relays_both_ways() {
        let (client_proxy_side, mut client) = tokio::io::duplex(1024);
        let (upstream_proxy_side, mut upstream) = tokio::io::duplex(1024);

        let relay = tokio::spawn(splice(
            Box::new(client_proxy_side),
            Box::new(upstream_proxy_side),
            CancellationToken::new(),
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_splice_stops_on_cancel() {
        let (a, _keep_a) = tokio::io::duplex(64);
        let (b, _keep_b) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let relay = tokio::spawn(splice(Box::new(a), Box::new(b), cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
