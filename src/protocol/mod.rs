pub mod parser;
pub mod pktline;

pub use parser::{classify, Command, FetchCommand};
pub use pktline::ProtocolError;
