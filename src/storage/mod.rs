//! Persistent scan state: the Bloom backing file and the transaction index.

pub mod bloom;
pub mod tx_index;
