// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use candle_core::Tensor;
use common::{
    hybrid_config_json, model_cache, tiny_config_json, write_fixture_repo, write_fixture_repo_with, write_speaker_repo,
    CountingSource, HYBRID_ID, TRANSFORMER_ID,
};
use serde_json::{json, Value};
use zonos::model::config::ZonosConfig;
use zonos::model::GenerationParams;
use zonos::{LoadOrigin, ZonosError};

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn assert_same_weights(a: &zonos::Zonos, b: &zonos::Zonos) {
    assert_eq!(a.state_dict().len(), b.state_dict().len());
    for (name, tensor) in a.state_dict() {
        let other = b.state_dict().get(name).unwrap_or_else(|| panic!("missing {name}"));
        let diff = (tensor - other).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6, "{name} differs");
    }
}

#[test]
fn fresh_resolve_writes_local_record() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let original = write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    let resolved = cache.resolve(TRANSFORMER_ID).unwrap();
    assert_eq!(resolved.origin, LoadOrigin::Fresh);
    assert_eq!(source.fetches(), 2);

    let record = cache.record(TRANSFORMER_ID);
    assert_eq!(record.dir(), models.path().join("Zonos-v0.1-transformer"));
    assert!(record.is_complete());

    let on_disk = read_json(&record.config_path());
    let mut keys: Vec<&str> = on_disk.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["backbone", "eos_token_id", "masked_token_id", "prefix_conditioner"]);
    assert_eq!(ZonosConfig::from_json(&on_disk).unwrap(), *original.config());
    assert_same_weights(&resolved.model, &original);
}

#[test]
fn second_resolve_uses_cache_without_fetching() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    let source = CountingSource::new(mirror.path());

    let first = model_cache(models.path(), &source).resolve(TRANSFORMER_ID).unwrap();
    let fetches = source.fetches();

    let cache = model_cache(models.path(), &source);
    let second = cache.resolve(TRANSFORMER_ID).unwrap();
    assert_eq!(second.origin, LoadOrigin::Cache);
    assert_eq!(source.fetches(), fetches);

    let on_disk = ZonosConfig::from_json(&read_json(&cache.record(TRANSFORMER_ID).config_path())).unwrap();
    assert_eq!(*second.model.config(), on_disk);
    assert_same_weights(&first.model, &second.model);
}

#[test]
fn corrupted_record_falls_back_to_direct_download() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    let record = cache.record(TRANSFORMER_ID);
    std::fs::create_dir_all(record.dir()).unwrap();
    let mut broken = tiny_config_json();
    broken.as_object_mut().unwrap().remove("eos_token_id");
    std::fs::write(record.config_path(), broken.to_string()).unwrap();
    std::fs::copy(mirror.path().join(TRANSFORMER_ID).join("model.safetensors"), record.weights_path()).unwrap();

    let resolved = cache.resolve(TRANSFORMER_ID).unwrap();
    let LoadOrigin::Fallback { reason } = &resolved.origin else {
        panic!("expected a fallback, got {}", resolved.origin);
    };
    assert!(reason.contains("eos_token_id"), "{reason}");

    // The fallback does not repair the record.
    assert!(read_json(&record.config_path()).get("eos_token_id").is_none());

    let prefix = Tensor::zeros((2, 3, 32), candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
    let params = GenerationParams { max_new_tokens: 4, seed: Some(7), ..GenerationParams::default() };
    let codes = resolved.model.generate(&prefix, 2.0, &params).unwrap();
    assert_eq!(codes.dims()[..2], [1, 9]);
}

#[test]
fn partial_record_is_downloaded_again() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    let record = cache.record(TRANSFORMER_ID);
    std::fs::create_dir_all(record.dir()).unwrap();
    std::fs::write(record.config_path(), "not json").unwrap();

    let resolved = cache.resolve(TRANSFORMER_ID).unwrap();
    assert_eq!(resolved.origin, LoadOrigin::Fresh);
    assert!(record.is_complete());
    assert!(record.read_config().is_ok());
}

#[test]
fn hybrid_backbone_resolves() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let original = write_fixture_repo_with(mirror.path(), HYBRID_ID, &hybrid_config_json());
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    let resolved = cache.resolve(HYBRID_ID).unwrap();
    assert_eq!(resolved.origin, LoadOrigin::Fresh);
    assert!(cache.record(HYBRID_ID).is_complete());
    assert!(!resolved.model.config().backbone.is_pure_transformer());
    assert_same_weights(&resolved.model, &original);

    let cached = model_cache(models.path(), &source).resolve(HYBRID_ID).unwrap();
    assert_eq!(cached.origin, LoadOrigin::Cache);
    assert_same_weights(&cached.model, &original);
}

#[test]
fn unknown_ssm_layer_is_rejected() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_fixture_repo(mirror.path(), HYBRID_ID);
    let mut hybrid = hybrid_config_json();
    hybrid["backbone"]["ssm_cfg"]["layer"] = json!("Mamba1");
    std::fs::write(mirror.path().join(HYBRID_ID).join("config.json"), hybrid.to_string()).unwrap();

    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);
    let err = cache.resolve(HYBRID_ID).unwrap_err();
    assert!(matches!(err, ZonosError::UnsupportedBackbone(_)), "{err}");
    assert!(!cache.record(HYBRID_ID).is_complete());
}

#[test]
fn resolved_models_share_a_lazy_speaker_encoder() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    write_speaker_repo(mirror.path());
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    let resolved = cache.resolve(TRANSFORMER_ID).unwrap();
    let fetches = source.fetches();
    assert!(resolved.model.has_speaker_encoder());
    assert!(!cache.speaker_encoder().is_loaded());

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
    let embedding = resolved.model.make_speaker_embedding(&samples, 16_000).unwrap();
    assert_eq!(embedding.dims(), [1, 1, 16]);
    assert!(cache.speaker_encoder().is_loaded());
    assert_eq!(source.fetches(), fetches + 2);
}

#[test]
fn identifiers_sharing_a_folder_share_a_record() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let first = write_fixture_repo(mirror.path(), TRANSFORMER_ID);
    write_fixture_repo(mirror.path(), "someone-else/Zonos-v0.1-transformer");
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);

    cache.resolve(TRANSFORMER_ID).unwrap();
    let fetches = source.fetches();
    let other = cache.resolve("someone-else/Zonos-v0.1-transformer").unwrap();
    assert_eq!(other.origin, LoadOrigin::Cache);
    assert_eq!(source.fetches(), fetches);
    assert_same_weights(&other.model, &first);
}

#[test]
fn missing_repository_is_an_error() {
    let mirror = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let source = CountingSource::new(mirror.path());
    let cache = model_cache(models.path(), &source);
    assert!(matches!(cache.resolve("nobody/nothing"), Err(ZonosError::Hub(_))));
}
