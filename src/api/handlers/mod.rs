pub mod execution;
pub mod health;
