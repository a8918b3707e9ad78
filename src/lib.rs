pub mod analysis;
pub mod error;
pub mod genes;
pub mod output;
pub mod posterior;
pub mod sampler;
pub mod schemas;

pub use error::{Error, Result};
