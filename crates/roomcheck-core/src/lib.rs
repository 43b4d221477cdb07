pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod policy;
pub mod traits;
pub mod types;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
