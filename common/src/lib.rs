pub mod api_error;
pub mod constants;
pub mod file_utils;
pub mod schemas;
pub mod states;
pub mod telemetry;
pub mod time_utils;
pub mod trace_middleware;
pub mod url_utils;
