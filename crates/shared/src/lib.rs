pub mod chat;
pub mod config;
mod config_env;
pub mod documents;
pub mod llm;
pub mod models;
pub mod repos;
pub mod sessions;
pub mod vault;
