#![allow(async_fn_in_trait)]
pub mod activation;
pub mod config;
pub mod convert;
pub mod credentials;
pub mod download;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod provider;
pub mod record;
pub mod retry;
pub mod status_store;
pub mod summary;
#[cfg(test)]
mod testing;
