//! Infrastructure layer: job queue, upload pipeline, stores, media client,
//! config and service wiring.

pub mod audit;
pub mod config;
pub mod db;
pub mod jobs;
pub mod media;
pub mod pipeline;
pub mod posts;
pub mod services;
pub mod staging;

pub use config::InfraConfig;
pub use services::{Collaborators, Services, ServicesError, build_services};
