//! R-tree structure and query tests over the memory store.

mod bounds_test;
mod query_test;
