//! Upload subsystem: hashing, blob storage, record storage and the session
//! manager that ties them together.

pub mod chunk_store;
pub mod file_utils;
pub mod hasher;
pub mod upload_repository;
pub mod upload_service;
