//! Async message-driven pipeline processing framework.
//!
//! A program is a composition of pipelines, each an ordered chain of
//! processors. An infrastructure ([`infrastructure::Infrastructure`]) binds
//! a started program to a dispatch runtime (in-line, worker pool, or
//! broker-backed) and drives [`engine::dispatch`] on every message.

pub mod cli;
pub mod config;
pub mod context;
pub mod demo;
pub mod engine;
pub mod error;
pub mod infrastructure;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod program;
pub mod response;
pub mod service;

pub use engine::{dispatch, EngineServices};
pub use error::EngineError;
pub use message::Message;
pub use pipeline::Pipeline;
pub use processor::Processor;
pub use program::{Program, ProgramBuilder};
pub use response::ResponseHandler;
