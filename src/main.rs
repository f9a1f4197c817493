//! Read-only MySQL MCP Server
//!
//! A Model Context Protocol (MCP) server that lets AI assistants inspect and
//! query MySQL databases without being able to change them. It speaks
//! JSON-RPC 2.0 over stdio.
//!
//! # Features
//!
//! - Lexical statement guard: one read-only statement per call, fail closed
//! - Database allow and block lists
//! - Row cap and timeout on every execution
//! - Catalog tools over `information_schema` with bound parameters only
//! - Sanitized error reporting

mod access;
mod catalog;
mod config;
mod db;
mod error;
mod executor;
mod guard;
mod normalize;
mod rpc;
mod server;
mod service;
mod tools;

use clap::Parser;
use config::{Args, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the protocol.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(args)?;

    if config.health_check {
        return server::health_check(&config).await;
    }
    server::run(config).await
}
