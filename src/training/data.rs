//! Text datasets and batch collation

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::engine::Batch;
use crate::error::{Error, Result};

const PAD_TOKENS: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];
const EOS_TOKENS: &[&str] = &["</s>", "<|endoftext|>", "<eos>", "<|end_of_text|>"];

/// One training example.
///
/// Without a `target` the model learns the whole `text`; with one, only the
/// target tokens count towards loss and accuracy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextRecord {
    /// Prompt or full text
    pub text: String,
    /// Completion to learn
    #[serde(default)]
    pub target: Option<String>,
}

impl TextRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Read one JSON record per line, skipping blank lines
pub async fn load_jsonl(path: &Path) -> Result<Vec<TextRecord>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: TextRecord = serde_json::from_str(line).map_err(|e| {
            Error::invalid_input(format!("{}:{}: {}", path.display(), line_no + 1, e))
        })?;
        records.push(record);
    }
    debug!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Index batches over `len` records, optionally shuffled with a fixed seed
pub fn batch_indices(len: usize, batch_size: usize, shuffle: Option<u64>) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    if let Some(seed) = shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
    }
    indices
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Turns text records into padded next-token batches
#[derive(Clone)]
pub struct Collator {
    tokenizer: Tokenizer,
    max_length: usize,
    pad_id: u32,
    eos_id: Option<u32>,
}

impl Collator {
    /// Padding and end-of-sequence ids are taken from the tokenizer when it
    /// defines them
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::config("max_length must be at least 2"));
        }
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| PAD_TOKENS.iter().find_map(|t| tokenizer.token_to_id(t)))
            .unwrap_or(0);
        let eos_id = EOS_TOKENS.iter().find_map(|t| tokenizer.token_to_id(t));
        Ok(Self {
            tokenizer,
            max_length,
            pad_id,
            eos_id,
        })
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    pub fn with_eos_id(mut self, eos_id: Option<u32>) -> Self {
        self.eos_id = eos_id;
        self
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Token ids of the full sequence and the index where learned tokens start
    fn encode(&self, record: &TextRecord) -> Result<(Vec<u32>, usize)> {
        let mut ids = self
            .tokenizer
            .encode(record.text.as_str(), true)?
            .get_ids()
            .to_vec();
        let learn_from = match &record.target {
            Some(target) => {
                let start = ids.len();
                ids.extend_from_slice(self.tokenizer.encode(target.as_str(), false)?.get_ids());
                start
            }
            None => 1,
        };
        ids.extend(self.eos_id);
        // One extra token since inputs and targets are shifted by one
        ids.truncate(self.max_length + 1);
        Ok((ids, learn_from))
    }

    /// Tokenize, shift, truncate and pad.
    ///
    /// Records that end up with fewer than two tokens or no learnable target
    /// token are skipped.
    pub fn collate(&self, records: &[TextRecord], device: &Device) -> Result<Batch> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let (ids, learn_from) = self.encode(record)?;
            if ids.len() < 2 || learn_from >= ids.len() {
                warn!("Skipping record with no learnable tokens: {:?}", record.text);
                continue;
            }
            rows.push((ids, learn_from));
        }
        if rows.is_empty() {
            return Err(Error::invalid_input("No usable records in batch"));
        }

        let seq_len = rows.iter().map(|(ids, _)| ids.len() - 1).max().unwrap_or(0);
        let total = rows.len() * seq_len;
        let mut input_ids = Vec::with_capacity(total);
        let mut targets = Vec::with_capacity(total);
        let mut attention = Vec::with_capacity(total);
        let mut label_mask = Vec::with_capacity(total);
        for (ids, learn_from) in &rows {
            let n = ids.len() - 1;
            for i in 0..seq_len {
                if i < n {
                    input_ids.push(ids[i]);
                    targets.push(ids[i + 1]);
                    attention.push(1u8);
                    label_mask.push(u8::from(i + 1 >= *learn_from));
                } else {
                    input_ids.push(self.pad_id);
                    targets.push(self.pad_id);
                    attention.push(0u8);
                    label_mask.push(0u8);
                }
            }
        }

        let shape = (rows.len(), seq_len);
        Ok(Batch::new(Tensor::from_vec(input_ids, shape, device)?)
            .with_attention_mask(Tensor::from_vec(attention, shape, device)?)
            .with_targets(Tensor::from_vec(targets, shape, device)?)
            .with_label_mask(Tensor::from_vec(label_mask, shape, device)?))
    }
}
