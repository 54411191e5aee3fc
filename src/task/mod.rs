pub mod context;
pub mod descriptor;
pub mod execution;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use context::*;
pub use descriptor::*;
pub use execution::*;
pub use scheduler::*;
pub use state::*;
pub use store::*;
pub use types::*;
