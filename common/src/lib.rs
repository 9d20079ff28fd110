pub mod types;
pub mod camera;
pub mod error;

pub use types::*;
pub use camera::*;
pub use error::*;
