//! Talkative core library: conversation window, completion client, streaming query
//! handler and the browser UI gateway used by the CLI.

pub mod config;
pub mod conversation;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod query;
