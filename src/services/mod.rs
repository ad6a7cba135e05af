pub mod blob_store;
pub mod clock;
pub mod conversion;
pub mod error;
pub mod id_allocator;
pub mod metadata_store;
pub mod reconciler;
pub mod storage_service;
pub mod sweeper;

#[cfg(test)]
pub mod test_support;
