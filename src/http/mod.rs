pub mod server;

pub use server::{run_http_server, run_metrics_server};
