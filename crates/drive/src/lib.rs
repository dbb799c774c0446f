pub mod api;
pub mod auth;
pub mod callback;
pub mod error;
pub mod mime;
pub mod oauth;
pub mod types;

pub use error::{DriveError, DriveResult};
pub use types::*;
