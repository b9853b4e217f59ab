pub mod error;
pub mod registry;
pub mod traits;

pub use error::{ToolError, ToolResult};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolDescriptor};
