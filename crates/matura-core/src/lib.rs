pub mod error;
pub mod fakes;
pub mod selector;
pub mod traits;
pub mod types;

pub use error::*;
pub use selector::select_speaker;
pub use traits::*;
pub use types::*;
