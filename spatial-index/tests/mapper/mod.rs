//! Element mappers attached to trees.

mod mapper_test;
