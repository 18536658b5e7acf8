pub mod cleaner;
pub mod follow;
pub mod lfs;
pub mod pack;
pub mod store;

pub use store::{ByteSink, Prepared};
