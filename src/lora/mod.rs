//! LoRA (Low-Rank Adaptation) support for parameter-efficient fine-tuning

pub mod adapter;
pub mod config;

pub use adapter::LoraAdapter;
pub use config::{
    AdapterConfig, BiasType, LoraConfig, TaskType, ADAPTER_CONFIG_FILENAME,
    ADAPTER_WEIGHTS_FILENAME,
};
