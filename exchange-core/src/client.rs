//! Interfaces of the process wide pool of data block service clients.
//!
//! The pool itself (connection lifecycle, protocol encoding, timeouts) lives outside this crate.
//! Sink handles only borrow a client per delivery attempt and always hand it back through
//! [PooledClient], whichever way the attempt ends.

use thiserror::Error;

use crate::event::{DataBlockEvent, EndOfDataBlockEvent, NewDataBlockEvent};
use crate::ids::Endpoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The remote call failed at the protocol layer. The client can't be trusted afterwards.
    #[error("Protocol Error - {0}")]
    Protocol(String),

    /// The connection to the remote node failed.
    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Can't get client for node {0}")]
    Unavailable(Endpoint),
}

impl ClientError {
    /// Whether the borrowed client has to be closed before it goes back to the pool.
    pub fn discards_client(&self) -> bool {
        matches!(self, ClientError::Protocol(_))
    }
}

/// Client of the data block service running on the consumer's node.
#[trait_variant::make(Send)]
pub trait DataBlockServiceClient {
    async fn on_new_data_block_event(
        &mut self,
        event: NewDataBlockEvent,
    ) -> Result<(), ClientError>;

    async fn on_end_of_data_block_event(
        &mut self,
        event: EndOfDataBlockEvent,
    ) -> Result<(), ClientError>;

    /// Closes the underlying connection, the client must not be reused.
    fn close(&mut self);

    /// Hands the client back to the pool it was borrowed from.
    fn return_self(&mut self);
}

/// Pool of [DataBlockServiceClient]s keyed by the remote endpoint.
#[trait_variant::make(Send)]
pub trait ClientManager {
    type Client: DataBlockServiceClient + Send + 'static;

    /// Borrows a client for `endpoint`. `Ok(None)` means the pool has no client to give right
    /// now, an error means the node could not be reached.
    async fn borrow_client(&self, endpoint: &Endpoint)
    -> Result<Option<Self::Client>, ClientError>;
}

/// PooledClient returns the client to its pool when it goes out of scope.
pub(crate) struct PooledClient<C: DataBlockServiceClient> {
    client: C,
}

impl<C: DataBlockServiceClient> PooledClient<C> {
    pub(crate) fn new(client: C) -> Self {
        Self { client }
    }

    pub(crate) async fn send(&mut self, event: &DataBlockEvent) -> Result<(), ClientError> {
        match event {
            DataBlockEvent::NewData(event) => {
                self.client.on_new_data_block_event(event.clone()).await
            }
            DataBlockEvent::EndOfData(event) => {
                self.client.on_end_of_data_block_event(event.clone()).await
            }
        }
    }

    pub(crate) fn close(&mut self) {
        self.client.close();
    }
}

impl<C: DataBlockServiceClient> Drop for PooledClient<C> {
    fn drop(&mut self) {
        self.client.return_self();
    }
}
