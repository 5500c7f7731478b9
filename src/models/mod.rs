pub mod chunk;
pub mod job;
pub mod speaker;

pub use chunk::*;
pub use job::*;
pub use speaker::*;
