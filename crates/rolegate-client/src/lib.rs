pub mod client;
pub mod config;
pub mod conversions;
pub mod error;
pub mod interceptor;
pub mod memory;
pub mod proto;

pub use client::AuthzEngineClient;
pub use config::ClientOptions;
pub use error::ClientError;
pub use memory::{EngineCall, InMemoryEngine};
