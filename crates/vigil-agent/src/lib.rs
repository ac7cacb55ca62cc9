pub mod adapter;
pub mod heuristic;
pub mod prompt;
pub mod remote;
pub mod render;

pub use adapter::TestGenAdapter;
pub use remote::HttpGenerator;
