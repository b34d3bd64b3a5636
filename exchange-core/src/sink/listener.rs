use crate::error::Error;
use crate::ids::ExchangeEdge;

/// SinkHandleListener is implemented by the driver owning the producing fragment instance, it
/// is how the exchange is tied into the fragment's own lifecycle.
///
/// Callbacks are invoked synchronously, outside the sink handle's lock, so implementations may
/// call back into the handle.
pub trait SinkHandleListener: Send + Sync {
    /// No more blocks will be produced and all the buffered ones were acknowledged. Invoked once.
    fn on_finish(&self, edge: &ExchangeEdge);

    /// The end of data block event was delivered and the handle is closed.
    fn on_closed(&self, edge: &ExchangeEdge);

    /// The handle was aborted, buffered blocks and their memory were released. Invoked once.
    fn on_aborted(&self, edge: &ExchangeEdge);

    /// A new data block event could not be delivered. The handle itself keeps working, it is up
    /// to the driver to decide whether to abort.
    fn on_failure(&self, edge: &ExchangeEdge, error: Error);
}
