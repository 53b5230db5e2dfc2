//! Transfer engine and the clients of the services it depends on.

pub mod archive_service;
pub mod chunk_cache;
pub mod download_service;
pub mod keystone;
#[cfg(test)]
pub mod memory_backend;
pub mod replication_service;
pub mod session;
pub mod signature;
pub mod swift;
pub mod transfer_service;
pub mod upload_service;
pub mod vault;
