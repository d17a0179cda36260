pub mod core;
pub mod loader;

pub use self::core::Compiler;
pub use self::loader::{load_definition, parse_definition};
