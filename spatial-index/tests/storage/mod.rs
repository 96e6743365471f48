//! Persistence tests for the paged and packed file formats.

mod file_store_test;
mod packed_test;
