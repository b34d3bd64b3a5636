use bytes::Bytes;

use crate::Result;

/// DataBlock is one unit of query result data moving across an exchange edge. The sink side
/// never looks inside a block, it only needs its retained size for memory accounting and its
/// serialized form for the pull path.
pub trait DataBlock: Send + Sync + 'static {
    /// Bytes retained by this block while it is buffered.
    fn retained_size_in_bytes(&self) -> u64;

    /// Serialized form handed to the consumer when it pulls the block.
    fn serialize(&self) -> Result<Bytes>;
}

/// A block whose payload is already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    payload: Bytes,
}

impl RawBlock {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl DataBlock for RawBlock {
    fn retained_size_in_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    fn serialize(&self) -> Result<Bytes> {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_block() {
        let block = RawBlock::new(vec![7u8; 12]);
        assert_eq!(block.retained_size_in_bytes(), 12);
        assert_eq!(block.serialize().unwrap(), Bytes::from(vec![7u8; 12]));
    }
}
