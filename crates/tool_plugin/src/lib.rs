//! Everything a toolhost tool links against: the message protocol, the
//! loopback channel, the capability API and the worker runtime.

pub mod api;
pub mod channel;
pub mod context;
pub mod error;
pub mod logging;
pub mod message;
pub mod module;
pub mod protocol;
pub mod runtime;

pub use api::{NotificationKind, NotificationOptions, ToolApi};
pub use context::{Disposable, Memento, WorkerContext};
pub use error::{Result, ToolHostError};
pub use message::{Message, MessageType};
pub use module::{ToolLoader, ToolModule};
pub use protocol::Protocol;
pub use runtime::{ToolIdentity, WorkerRuntime, run};
