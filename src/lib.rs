pub mod error;
pub mod model;
pub mod parsing;

pub use error::{Error, Result};
