//! Test suite for the training pipeline
//!
//! Covers the epoch loop, checkpointing and end-to-end runs on small
//! synthetic clip sets.


pub mod test_utils;

pub use fixtures::TrainingTestFixture;
pub use mock_data::{create_mock_dataset, ThreeGroupProbe};
pub use test_utils::{
    assert_history_valid, create_test_config, create_test_device, create_test_loader, create_test_model,
};
