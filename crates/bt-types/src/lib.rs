pub mod errors;
pub mod job;
pub mod space;

pub use errors::*;
pub use job::*;
pub use space::*;
