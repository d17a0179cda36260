pub mod context;
pub mod definition;
pub mod engine;
pub mod handler;
pub mod instance;
pub mod recorder;
pub mod redis_recorder;
pub mod state;

pub use engine::Engine;
pub use handler::{FlowResult, ResultHandler, result_channel};
pub use instance::Instance;
