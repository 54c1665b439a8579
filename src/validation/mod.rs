pub mod dataset_validator;

pub use dataset_validator::DatasetValidator;
