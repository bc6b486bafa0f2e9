pub mod config;
pub mod error;
pub mod lease;
pub mod link;
pub mod options;
pub mod packet;
pub mod reply;
pub mod server;

pub use config::{Config, SubnetConfig};
pub use error::{Error, Result};
pub use lease::{ClientId, Lease, LeaseDb};
pub use link::{Link, RawLink};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use server::{DhcpServer, SubnetRunner};
