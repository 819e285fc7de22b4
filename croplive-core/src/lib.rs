pub mod analysis;
pub mod config;
pub mod error;
pub mod state;
pub mod types;

// Keep the public surface small and intentional.
pub use analysis::*;
pub use config::*;
pub use error::*;
pub use state::*;
pub use types::*;
