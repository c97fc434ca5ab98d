pub mod error;

pub use error::{RecastError, Result};
