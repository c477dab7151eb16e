pub(crate) mod components;

mod group_tests;
mod lifecycle_tests;
