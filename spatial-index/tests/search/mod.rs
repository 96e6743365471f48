//! Lifecycle and consistency tests for lazy search results.

mod concurrency_test;
mod resource_test;
