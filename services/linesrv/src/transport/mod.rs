//! TCP transport for the PLC and upper computer links

pub mod codec;
pub mod connection;

pub use codec::{JsonFrameCodec, ScanLineCodec};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats, FrameHandler,
};
