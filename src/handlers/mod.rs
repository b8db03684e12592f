pub mod broadcast;
pub mod config;
pub mod conversions;
pub mod recordings;

pub use broadcast::*;
pub use config::*;
pub use conversions::*;
pub use recordings::*;
