pub mod adapter;
pub mod command;
pub mod convert;
pub mod error;
pub mod recording;
pub mod types;

pub use adapter::*;
pub use command::*;
pub use convert::*;
pub use error::*;
pub use recording::*;
pub use types::*;
