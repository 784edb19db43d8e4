//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - anthropic messages/tools, sent from the agent to the model
//! - MCP tool listings and call results, exchanged with the tool providers
//! - the conversation projection handed to whatever renders it
//!
//! We always immediately convert those data models into the internal structs using
//! to/from helpers, so the internal models are not an exact match to either wire format.
pub mod content;
pub mod conversation;
pub mod message;
pub mod role;
pub mod tool;
