pub mod deletion;
pub mod operations;
