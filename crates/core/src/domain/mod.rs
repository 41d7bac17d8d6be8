pub mod assignment;
pub mod capacity;
pub mod lead;
pub mod queue;
pub mod rule;
