pub mod client;
pub mod config;
pub mod exchange;
pub mod http11;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod thread;

pub use client::{AjpClient, AjpResponse};
pub use config::{ConnectorConfig, ListenAddress, ProtocolKind};
pub use exchange::{Adapter, Exchange, Request, Response, ServiceError};
pub use pool::{ObjectPool, Recycle};
pub use server::{Connector, ShutdownHandle};
