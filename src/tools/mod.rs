pub mod clock;
pub mod executor;
pub mod news;
pub mod registry;
pub mod schema;
pub mod weather;

pub use clock::ClockTool;
pub use executor::ToolExecutor;
pub use news::NewsTool;
pub use registry::{not_found, ParamSpec, Tool, ToolCallResult, ToolRegistry, ToolSpec};
pub use schema::{params_from_schema, parse_args};
pub use weather::WeatherTool;
