pub mod approval;
pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod hooks;
pub mod profiles;
pub mod provider;
pub mod reasoning;
pub mod sandbox;
pub mod schema;
pub mod session;
pub mod tool_policy;
pub mod tools;
