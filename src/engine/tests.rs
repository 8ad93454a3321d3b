use super::*;
use crate::error::Error;
use crate::lora::{AdapterConfig, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
use crate::model::loader::{CONFIG_FILENAME, TOKENIZER_FILENAME, WEIGHTS_FILENAME};
use crate::model::ForwardContext;
use crate::training::CrossEntropyLoss;
use crate::test_utils::{tiny_model, word_tokenizer, VOCAB_SIZE};
use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;
use tempfile::TempDir;

fn cpu_options(options: EngineOptions) -> EngineOptions {
    options.with_device(Device::Cpu)
}

async fn in_memory_engine() -> CausalEngine {
    CausalEngine::load(cpu_options(EngineOptions::from_pretrained(
        tiny_model(),
        word_tokenizer(),
    )))
    .await
    .unwrap()
}

/// Engine saved to a temp dir, for loading by path or name
async fn saved_checkpoint() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    in_memory_engine().await.save(dir.path()).unwrap();
    dir
}

fn batch() -> Batch {
    let device = Device::Cpu;
    let input_ids = Tensor::new(&[[2u32, 4, 5, 6], [2, 9, 10, 0]], &device).unwrap();
    let targets = Tensor::new(&[[4u32, 5, 6, 3], [9, 10, 3, 0]], &device).unwrap();
    let attention_mask = Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 1, 0]], &device).unwrap();
    Batch::new(input_ids)
        .with_attention_mask(attention_mask)
        .with_targets(targets)
}

fn label_mask() -> Tensor {
    Tensor::new(&[[0u8, 0, 1, 1], [0, 1, 1, 0]], &Device::Cpu).unwrap()
}

fn scalar(loss: &Tensor) -> f32 {
    assert!(loss.dims().is_empty(), "loss should be a scalar");
    assert_eq!(loss.dtype(), DType::F32);
    loss.to_scalar::<f32>().unwrap()
}

#[tokio::test]
async fn test_load_without_source_fails() {
    let result = CausalEngine::load(cpu_options(EngineOptions::default())).await;
    match result {
        Err(err @ Error::MissingModelSource) => assert_eq!(
            err.to_string(),
            "Please provide a model_name, the weights path or model and tokenizer."
        ),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("load should fail without a source"),
    }
}

#[tokio::test]
async fn test_model_without_tokenizer_is_not_a_source() {
    let options = EngineOptions {
        model: Some(tiny_model()),
        ..EngineOptions::default()
    };
    let result = CausalEngine::load(cpu_options(options)).await;
    assert!(matches!(result, Err(Error::MissingModelSource)));
}

#[tokio::test]
async fn test_load_from_supplied_model_and_tokenizer() {
    let engine = in_memory_engine().await;
    assert_eq!(engine.model().config().vocab_size, VOCAB_SIZE);
    assert!(engine.tokenizer().token_to_id("cat").is_some());
    assert!(!engine.load_8bit());
    assert!(engine.model_name().is_none());
}

#[tokio::test]
async fn test_load_from_weights_path() {
    let dir = saved_checkpoint().await;
    for file in [WEIGHTS_FILENAME, CONFIG_FILENAME, TOKENIZER_FILENAME] {
        assert!(dir.path().join(file).exists(), "{} missing", file);
    }

    let engine = CausalEngine::load(cpu_options(EngineOptions::from_weights_path(dir.path())))
        .await
        .unwrap();
    assert_eq!(engine.model().config().vocab_size, VOCAB_SIZE);
    assert_eq!(engine.tokenizer().token_to_id("mat"), Some(8));
    assert!(engine.model_name().is_some());
}

#[tokio::test]
async fn test_weights_path_must_be_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("weights.bin");
    std::fs::write(&file, b"not a directory").unwrap();
    let result = CausalEngine::load(cpu_options(EngineOptions::from_weights_path(&file))).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_weights_path_takes_precedence() {
    let dir = saved_checkpoint().await;
    let options = EngineOptions {
        weights_path: Some(dir.path().to_path_buf()),
        model_name: Some("does-not-exist/anywhere".to_string()),
        ..EngineOptions::default()
    };
    assert!(CausalEngine::load(cpu_options(options)).await.is_ok());
}

#[tokio::test]
async fn test_load_from_local_model_name() {
    let dir = saved_checkpoint().await;
    let name = dir.path().to_string_lossy().to_string();
    let engine = CausalEngine::load(cpu_options(EngineOptions::from_model_name(&name)))
        .await
        .unwrap();
    assert_eq!(engine.model_name(), Some(name.as_str()));
    assert!(engine.tokenizer().token_to_id("dog").is_some());
}

#[tokio::test]
async fn test_saved_weights_reproduce_outputs() {
    let original = in_memory_engine().await;
    let dir = tempfile::tempdir().unwrap();
    original.save(dir.path()).unwrap();
    let restored = CausalEngine::load(cpu_options(EngineOptions::from_weights_path(dir.path())))
        .await
        .unwrap();

    let batch = batch();
    let a = scalar(&original.training_step(&batch).unwrap());
    let b = scalar(&restored.training_step(&batch).unwrap());
    approx::assert_abs_diff_eq!(a, b, epsilon = 1e-4);
}

#[tokio::test]
async fn test_training_step_with_and_without_label_mask() {
    let engine = in_memory_engine().await;
    let unmasked = scalar(&engine.training_step(&batch()).unwrap());
    assert!(unmasked.is_finite() && unmasked > 0.0);

    let masked = scalar(
        &engine
            .training_step(&batch().with_label_mask(label_mask()))
            .unwrap(),
    );
    assert!(masked.is_finite() && masked > 0.0);
}

#[tokio::test]
async fn test_training_step_requires_targets() {
    let engine = in_memory_engine().await;
    let ids = Tensor::new(&[[2u32, 4, 5]], &Device::Cpu).unwrap();
    let result = engine.training_step(&Batch::new(ids));
    assert!(matches!(result, Err(Error::MissingBatchField("targets"))));
}

#[tokio::test]
async fn test_validation_step_is_a_fraction() {
    let engine = in_memory_engine().await;
    let accuracy = engine.validation_step(&batch()).unwrap();
    assert!((0.0..=1.0).contains(&accuracy));

    // The label mask is ignored unless masked scoring is requested
    let unmasked = engine
        .validation_step(&batch().with_label_mask(label_mask()))
        .unwrap();
    assert_eq!(unmasked, accuracy);
    let empty_mask = Tensor::zeros((2, 4), DType::U8, &Device::Cpu).unwrap();
    let with_empty_mask = engine
        .validation_step(&batch().with_label_mask(empty_mask))
        .unwrap();
    assert_eq!(with_empty_mask, accuracy);
}

#[tokio::test]
async fn test_masked_validation_scores_target_tokens_only() {
    let engine = CausalEngine::load(cpu_options(
        EngineOptions::from_pretrained(tiny_model(), word_tokenizer()).with_masked_accuracy(true),
    ))
    .await
    .unwrap();

    let masked = engine
        .validation_step(&batch().with_label_mask(label_mask()))
        .unwrap();
    // Four masked positions, so the score is a multiple of a quarter
    assert!((0.0..=1.0).contains(&masked));
    assert_eq!((masked * 4.0).fract(), 0.0);

    let empty_mask = Tensor::zeros((2, 4), DType::U8, &Device::Cpu).unwrap();
    let result = engine.validation_step(&batch().with_label_mask(empty_mask));
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_training_step_backpropagates_into_full_model() {
    let engine = in_memory_engine().await;
    let vars = engine.trainable_vars();
    assert_eq!(
        vars.iter().map(|v| v.elem_count()).sum::<usize>(),
        engine.model().parameter_counts().total
    );

    let mut opt = candle_nn::AdamW::new(
        vars,
        candle_nn::ParamsAdamW {
            lr: 1e-2,
            ..Default::default()
        },
    )
    .unwrap();
    let batch = batch().with_label_mask(label_mask());
    let before = engine.training_step(&batch).unwrap();
    opt.backward_step(&before).unwrap();
    let after = engine.training_step(&batch).unwrap();
    assert!(scalar(&after) < scalar(&before));
}

#[tokio::test]
async fn test_8bit_load_freezes_quantized_base() {
    let dir = saved_checkpoint().await;
    let options = EngineOptions::from_weights_path(dir.path()).with_8bit(true);
    let engine = CausalEngine::load(cpu_options(options)).await.unwrap();
    assert!(engine.load_8bit());
    assert!(engine.model().is_quantized());
    assert!(engine.trainable_vars().is_empty());

    let loss = scalar(&engine.training_step(&batch()).unwrap());
    assert!(loss.is_finite());
}

#[tokio::test]
async fn test_lora_engine_trains_adapters_only() {
    let engine = CausalLoraEngine::load(
        cpu_options(EngineOptions::from_pretrained(tiny_model(), word_tokenizer())),
        None,
    )
    .await
    .unwrap();

    let config = engine.lora_config();
    assert_eq!((config.r, config.lora_alpha, config.lora_dropout), (8, 32.0, 0.05));

    let counts = engine.model().parameter_counts();
    let adapter_params: usize = engine.trainable_vars().iter().map(|v| v.elem_count()).sum();
    assert_eq!(counts.trainable, adapter_params);
    assert!(counts.trainable < counts.total);

    let loss = engine.training_step(&batch()).unwrap();
    let grads = loss.backward().unwrap();
    for var in engine.trainable_vars() {
        assert!(grads.get(var.as_tensor()).is_some());
    }
}

#[tokio::test]
async fn test_lora_engine_custom_targets() {
    let engine = CausalLoraEngine::load(
        cpu_options(EngineOptions::from_pretrained(tiny_model(), word_tokenizer())),
        Some(vec!["up_proj".to_string(), "down_proj".to_string()]),
    )
    .await
    .unwrap();
    // rank 8 over (128x64) and (64x128), two layers
    let expected = 2 * ((8 * 64 + 128 * 8) + (8 * 128 + 64 * 8));
    assert_eq!(engine.model().parameter_counts().trainable, expected);

    let result = CausalLoraEngine::load(
        cpu_options(EngineOptions::from_pretrained(tiny_model(), word_tokenizer())),
        Some(vec!["query_key_value".to_string()]),
    )
    .await;
    assert!(matches!(result, Err(Error::Lora(_))));
}

#[tokio::test]
async fn test_lora_over_8bit_base() {
    let dir = saved_checkpoint().await;
    let options = EngineOptions::from_weights_path(dir.path()).with_8bit(true);
    let engine = CausalLoraEngine::load(cpu_options(options), None).await.unwrap();
    let vars = engine.trainable_vars();
    assert!(!vars.is_empty());
    assert!(vars.iter().all(|v| v.dtype() == DType::F32));
    assert!(scalar(&engine.training_step(&batch()).unwrap()).is_finite());
}

#[tokio::test]
async fn test_lora_over_8bit_base_under_half_precision_autocast() {
    let dir = saved_checkpoint().await;
    let options = EngineOptions::from_weights_path(dir.path()).with_8bit(true);
    let engine = CausalLoraEngine::load(cpu_options(options), None).await.unwrap();
    assert!(engine.model().is_quantized());

    let batch = batch().with_label_mask(label_mask());
    let ctx = ForwardContext::train().with_autocast(Some(DType::F16));
    let logits = engine
        .model()
        .forward(batch.input_ids(), batch.attention_mask(), &ctx)
        .unwrap();
    assert_eq!(logits.dtype(), DType::F32);
    assert_eq!(logits.dims(), &[2, 4, VOCAB_SIZE]);

    let loss = CrossEntropyLoss::new()
        .forward(&logits, batch.targets().unwrap(), batch.label_mask())
        .unwrap();
    assert!(scalar(&loss).is_finite());

    let grads = loss.backward().unwrap();
    let vars = engine.trainable_vars();
    // lora_A and lora_B on q_proj and v_proj, two layers
    assert_eq!(vars.len(), 8);
    for var in &vars {
        let grad = grads.get(var.as_tensor()).expect("adapter var has no gradient");
        assert_eq!(grad.dtype(), DType::F32);
    }
}

#[tokio::test]
async fn test_lora_save_and_restore() {
    let engine = CausalLoraEngine::load(
        cpu_options(EngineOptions::from_pretrained(tiny_model(), word_tokenizer())),
        None,
    )
    .await
    .unwrap();

    // Move the adapters away from their zero start
    let mut opt = candle_nn::AdamW::new(
        engine.trainable_vars(),
        candle_nn::ParamsAdamW {
            lr: 5e-2,
            ..Default::default()
        },
    )
    .unwrap();
    for _ in 0..3 {
        let loss = engine.training_step(&batch()).unwrap();
        opt.backward_step(&loss).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    engine.save(dir.path()).unwrap();
    assert!(dir.path().join(ADAPTER_WEIGHTS_FILENAME).exists());
    assert!(dir.path().join(TOKENIZER_FILENAME).exists());
    assert!(!dir.path().join(WEIGHTS_FILENAME).exists());

    let adapter_config = AdapterConfig::from_file(dir.path().join(ADAPTER_CONFIG_FILENAME)).unwrap();
    assert_eq!(adapter_config.peft_type, "LORA");
    assert_eq!(adapter_config.r, 8);
    assert_eq!(adapter_config.target_modules, vec!["q_proj", "v_proj"]);

    let names: Vec<String> = candle_core::safetensors::load(
        dir.path().join(ADAPTER_WEIGHTS_FILENAME),
        &Device::Cpu,
    )
    .unwrap()
    .into_keys()
    .collect();
    assert!(names
        .iter()
        .all(|n| n.starts_with("base_model.model.model.layers.") && n.contains(".lora_")));

    // Same base weights, adapters restored from disk
    let base_dir = tempfile::tempdir().unwrap();
    engine.inner().save(base_dir.path()).unwrap();
    let base = CausalEngine::load(cpu_options(EngineOptions::from_weights_path(base_dir.path())))
        .await
        .unwrap();
    let restored = CausalLoraEngine::from_adapter_dir(base, dir.path()).unwrap();

    let expected = engine.validation_step(&batch()).unwrap();
    let actual = restored.validation_step(&batch()).unwrap();
    approx::assert_abs_diff_eq!(expected, actual, epsilon = 1e-9);
}
