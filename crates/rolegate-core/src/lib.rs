pub mod grant;
pub mod ids;
pub mod policy;
pub mod resolver;
pub mod sync;
