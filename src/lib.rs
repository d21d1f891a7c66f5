pub mod config;
pub mod events;
pub mod host;
pub mod logger;
pub mod schema;
pub mod services;
pub mod supervisor;
pub mod tool;

pub use tool_plugin::{Message, MessageType, ToolHostError};
