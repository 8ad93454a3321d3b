//! Shared fixtures for unit tests

use candle_core::{DType, Device};
use std::str::FromStr;
use tokenizers::Tokenizer;

use crate::model::{CausalLm, CausalLmConfig};

pub const VOCAB: &[&str] = &[
    "<pad>", "<unk>", "<s>", "</s>", "the", "cat", "sat", "on", "mat", "dog", "ran", "to", "a",
    "park", "what", "is", "color", "sky", "blue", "green", "yes", "no", "question", "answer",
];

/// Vocabulary size of [`word_tokenizer`], rounded up for the model
pub const VOCAB_SIZE: usize = 32;

/// Whitespace word-level tokenizer over [`VOCAB`]
pub fn word_tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::Value::from(i as u64)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    Tokenizer::from_str(&json.to_string()).expect("valid tokenizer json")
}

pub fn tiny_model() -> CausalLm {
    CausalLm::random(CausalLmConfig::tiny(VOCAB_SIZE), DType::F32, &Device::Cpu)
        .expect("tiny model")
}
