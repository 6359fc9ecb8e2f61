pub mod agent;
pub mod config;
pub mod git;
pub mod integration;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod scheduler;
pub mod tasks;
pub mod terminal;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
