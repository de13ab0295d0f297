// SIP dispatcher core: transport legs, retransmission queue, resolver, registrar.
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod dispatcher;
pub mod error;
pub mod eventloop;
pub mod message;
pub mod registrar;
pub mod resolver;
pub mod rsip_ext;
pub mod transport;
pub use dispatcher::{CancelKey, DeliverOpts, Dispatcher, DispatcherBuilder, Receiver};
