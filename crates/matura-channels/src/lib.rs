pub mod address;
pub mod evolution;
pub mod loopback;

pub use address::normalize_address;
pub use evolution::{EvolutionChannel, parse_webhook_event};
pub use loopback::{LoopbackChannel, LoopbackHandle, loopback_pair};
