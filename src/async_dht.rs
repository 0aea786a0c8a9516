//! AsyncDht node.

use crate::{
    common::{Contact, Id, RoutingTable},
    dht::{ActorMessage, Dht, DhtTraversalError, DhtWasShutdown, LookupResponse},
    rpc::{AnnounceResult, Info, TraversalError},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
             .0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of the routing table.
    pub async fn routing_table(&self) -> Result<RoutingTable, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTable>(1);

        self.0
             .0
            .send(ActorMessage::RoutingTable(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.0
             .0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Async version of [Dht::bootstrap].
    pub async fn bootstrap(&self, contacts: &[Contact]) -> Result<usize, DhtTraversalError> {
        let (sender, receiver) = flume::bounded::<Result<usize, TraversalError>>(1);

        self.0
             .0
            .send(ActorMessage::Bootstrap(contacts.to_vec(), sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    /// Async version of [Dht::lookup].
    pub async fn lookup(
        &self,
        info_hash: Id,
    ) -> Result<flume::r#async::RecvStream<'static, LookupResponse>, DhtTraversalError> {
        let (started, responses) = self.0.start_lookup(info_hash)?;

        started.recv_async().await.map_err(|_| DhtWasShutdown)??;

        Ok(responses.into_stream())
    }

    /// Async version of [Dht::announce].
    pub async fn announce(
        &self,
        info_hash: Id,
        port: Option<u16>,
    ) -> Result<AnnounceResult, DhtTraversalError> {
        let (sender, receiver) = flume::bounded::<Result<AnnounceResult, TraversalError>>(1);

        self.0
             .0
            .send(ActorMessage::Announce(info_hash, port, sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }
}

#[cfg(test)]
mod test {
    use futures::executor;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut dht = Dht::builder().port(0).build().unwrap().as_async();
            let clone = dht.clone();

            dht.shutdown().await;

            assert!(clone.info().await.is_err());
        }

        executor::block_on(test());
    }

    #[test]
    fn no_known_nodes() {
        async fn test() {
            let dht = Dht::builder().port(0).build().unwrap().as_async();

            assert!(matches!(
                dht.lookup(Id::random()).await,
                Err(DhtTraversalError::Traversal(TraversalError::NoKnownNodes))
            ));
            assert_eq!(dht.to_bootstrap().await.unwrap(), Vec::<String>::new());
        }

        executor::block_on(test());
    }
}
