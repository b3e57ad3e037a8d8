pub mod harness;

pub use harness::{HarnessBuilder, TestHarness, search_hit};
