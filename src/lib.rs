pub mod app;
pub mod auth;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod providers;
pub mod registry;

pub use error::{Error, Result};
