pub mod codec;
mod engine;
mod error;
pub mod llm;
mod midi_file;
mod model;
mod session;
mod transport;
mod util;

pub use engine::*;
pub use error::*;
pub use midi_file::*;
pub use model::config::*;
pub use model::event::*;
pub use model::sequence::*;
pub use model::tempo::*;
pub use session::*;
pub use transport::*;
pub use util::*;
