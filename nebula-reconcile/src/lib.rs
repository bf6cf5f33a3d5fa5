//! Declarative convergence of OpenNebula templates, images and virtual
//! networks over the XML-RPC API.

pub mod agent;
pub mod clients;
pub mod config;
pub mod document;
pub mod error;
pub mod permissions;
pub mod poller;
pub mod reconciler;
pub mod resolver;

pub use config::Config;
pub use error::{Error, Result};
