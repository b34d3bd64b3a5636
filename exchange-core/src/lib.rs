//! Sink side of the data exchange between fragment instances of a distributed query.
//!
//! A producing fragment instance pushes blocks into its [SinkHandle], which buffers them under
//! the query's [MemoryPool] budget and tells the consumer about them through the
//! [DataBlockServiceClient]s borrowed from a [ClientManager]. The consumer pulls and
//! acknowledges the blocks through the [ExchangeManager].

pub use self::error::{Error, Result};

mod error;

pub mod block;
pub mod client;
pub mod config;
pub mod event;
pub mod ids;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod sink;

#[cfg(test)]
mod test_utils;

pub use crate::block::{DataBlock, RawBlock};
pub use crate::client::{ClientError, ClientManager, DataBlockServiceClient};
pub use crate::manager::ExchangeManager;
pub use crate::memory::{Blocked, MemoryPool};
pub use crate::sink::{SinkHandle, SinkHandleListener, SinkStatus};
