pub mod optimizer;
pub mod progress;
pub mod schedule;
pub mod trainer;
