// Library modules
pub mod byte_stream;
pub mod config;
pub mod constants;
pub mod device_msgs;
pub mod forwarder;
pub mod fragment;
pub mod framer;
pub mod iface;
pub mod list;
pub mod message;
pub mod server;

// Re-export commonly used types
pub use byte_stream::{ByteStream, TcpByteStream};
pub use config::Config;
pub use forwarder::NpiConnection;
pub use framer::{FrameOptions, classify};
pub use iface::{InterfaceConfig, MsgInterface, TransmitOutcome};
pub use message::{BaseClass, IfaceId, Message, MessageKind};
pub use server::{Server, ServerOptions};

#[cfg(feature = "serial")]
pub use byte_stream::SerialByteStream;
