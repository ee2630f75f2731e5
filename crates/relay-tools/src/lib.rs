pub mod args;
pub mod format;
pub mod registry;

pub use args::prepare_arguments;
pub use format::{format_tool_results, truncate_output};
pub use registry::{ExecutedTool, ToolRegistry};
