pub mod endpoint;
pub mod lease;
pub mod settings;
pub mod stats;

pub use endpoint::*;
pub use lease::*;
pub use settings::*;
pub use stats::*;
