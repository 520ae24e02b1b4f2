use std::collections::HashMap;
use std::path::Path;

use lowmem_checkpoint::pretrained::{CHECKPOINT_NAME, CONFIG_NAME};
use lowmem_checkpoint::split::KEY_TO_FILENAME_JSON;
use lowmem_checkpoint::{
    from_pretrained, load_manifest, load_split, nullify, sanitize_file_name, save_pretrained_split,
    save_split, CheckpointError, DeferredSource, EmptySpec, LazyRegistry, PretrainedConfig,
    PretrainedModel, SplitEntry,
};
use lowmem_core::{alloc, DType, Tensor};
use lowmem_nn::{greedy_search, serialization, CausalLm, Embedding, LazyLinear, Linear, Module, Param};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ============================================================================
// Test model
// ============================================================================

struct TinyModel {
    embed: Embedding,
    blocks: Vec<Linear>,
    head: LazyLinear,
}

impl TinyModel {
    fn new(vocab: usize, dim: usize, n_blocks: usize) -> Self {
        Self {
            embed: Embedding::new(vocab, dim),
            blocks: (0..n_blocks).map(|_| Linear::new(dim, dim, true)).collect(),
            head: LazyLinear::new(vocab, false, DType::F32),
        }
    }

    /// A fully backed model to write checkpoints from.
    fn reference(vocab: usize, dim: usize, n_blocks: usize) -> Self {
        let mut model = Self::new(vocab, dim, n_blocks);
        model.head.initialize(dim).unwrap();
        model
    }
}

impl Module for TinyModel {
    fn params(&self) -> Vec<(&str, &Param)> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        Vec::new()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        let mut children = vec![("embed".to_string(), &self.embed as &dyn Module)];
        for (i, block) in self.blocks.iter().enumerate() {
            children.push((format!("blocks.{i}"), block as &dyn Module));
        }
        children.push(("head".to_string(), &self.head as &dyn Module));
        children
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        let mut children = vec![("embed".to_string(), &mut self.embed as &mut dyn Module)];
        for (i, block) in self.blocks.iter_mut().enumerate() {
            children.push((format!("blocks.{i}"), block as &mut dyn Module));
        }
        children.push(("head".to_string(), &mut self.head as &mut dyn Module));
        children
    }
}

impl PretrainedModel for TinyModel {
    type Config = PretrainedConfig;

    fn from_config(config: &PretrainedConfig) -> lowmem_checkpoint::Result<Self> {
        Ok(Self::new(
            config.vocab_size.unwrap_or(16),
            config.d_model.unwrap_or(8),
            config.n_layers.unwrap_or(2),
        ))
    }
}

impl CausalLm for TinyModel {
    fn reset(&mut self) {}

    fn forward(&mut self, token_ids: &[u32], _position_ids: &[u32]) -> lowmem_core::Result<Tensor> {
        let last = token_ids.len().saturating_sub(1);
        let mut x = self.embed.lookup(&token_ids[last..])?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.head.forward(&x)
    }
}

/// Wraps a checkpoint-compatible model under a different tree.
struct Wrapper {
    inner: TinyModel,
}

impl Module for Wrapper {
    fn params(&self) -> Vec<(&str, &Param)> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<(&str, &mut Param)> {
        Vec::new()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![("inner".to_string(), &self.inner as &dyn Module)]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![("inner".to_string(), &mut self.inner as &mut dyn Module)]
    }
}

impl PretrainedModel for Wrapper {
    type Config = PretrainedConfig;

    fn from_config(config: &PretrainedConfig) -> lowmem_checkpoint::Result<Self> {
        Ok(Self {
            inner: TinyModel::from_config(config)?,
        })
    }

    fn checkpoint_module(&self) -> &dyn Module {
        &self.inner
    }

    fn checkpoint_module_mut(&mut self) -> &mut dyn Module {
        &mut self.inner
    }
}

fn assert_same_weights(a: &dyn Module, b: &dyn Module) {
    let a = a.named_parameters();
    let b = b.named_parameters();
    assert_eq!(a.len(), b.len());
    for ((na, pa), (nb, pb)) in a.iter().zip(&b) {
        assert_eq!(na, nb);
        let (ta, tb) = (pa.tensor().unwrap(), pb.tensor().unwrap());
        assert_eq!(ta.shape(), tb.shape(), "{na}");
        assert_eq!(ta.dtype(), tb.dtype(), "{na}");
        assert_eq!(ta.as_bytes(), tb.as_bytes(), "{na}");
    }
}

fn write_config(dir: &Path) {
    std::fs::write(
        dir.join(CONFIG_NAME),
        r#"{"vocab_size": 16, "hidden_size": 8, "num_hidden_layers": 2, "torch_dtype": "float32"}"#,
    )
    .unwrap();
}

// ============================================================================
// Split store
// ============================================================================

#[test]
fn split_round_trip_keeps_awkward_names() {
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        ("embed tokens.weight".to_string(), Tensor::from_f32(&[1.0, 2.0], &[2])),
        ("층.가중치".to_string(), Tensor::from_f32(&[3.0], &[1]).to_dtype(DType::BF16)),
        ("a/b:c?d*".to_string(), Tensor::from_slice(&[1i64, -2], &[2]).unwrap()),
        ("  padded  ".to_string(), Tensor::zeros(&[2, 2], DType::F16)),
        ("scalar".to_string(), Tensor::from_f32(&[9.0], &[])),
    ];
    let split_entries: Vec<(String, SplitEntry)> = entries
        .iter()
        .map(|(n, t)| (n.clone(), SplitEntry::from(t.clone())))
        .collect();
    save_split(&split_entries, dir.path()).unwrap();

    let manifest = load_manifest(dir.path()).unwrap();
    let keys: Vec<&str> = manifest.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, entries.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>());

    let loaded = load_split(dir.path()).unwrap();
    assert_eq!(loaded.len(), entries.len());
    for ((name, expected), (loaded_name, entry)) in entries.iter().zip(&loaded) {
        assert_eq!(name, loaded_name);
        let SplitEntry::Tensor(t) = entry else {
            panic!("{name} came back as an empty spec");
        };
        assert_eq!(t.shape(), expected.shape());
        assert_eq!(t.dtype(), expected.dtype());
        assert_eq!(t.as_bytes(), expected.as_bytes());
    }
}

#[test]
fn colliding_names_get_distinct_files() {
    let dir = tempfile::tempdir().unwrap();
    let names = ["a b", "a_b", " a b ", "a?_b", "a_b!"];
    let entries: Vec<(String, SplitEntry)> = names
        .iter()
        .map(|n| (n.to_string(), SplitEntry::from(Tensor::ones(&[1]))))
        .collect();
    let manifest = save_split(&entries, dir.path()).unwrap();

    let mut files: Vec<&str> = manifest.iter().map(|(_, f)| f).collect();
    assert_eq!(files.len(), names.len());
    for file in &files {
        assert!(dir.path().join(file).is_file());
        assert!(file.ends_with(".a_b"));
    }
    files.sort();
    files.dedup();
    assert_eq!(files.len(), names.len());
    assert!(dir.path().join(KEY_TO_FILENAME_JSON).is_file());
}

#[test]
fn sanitization_never_yields_reserved_names() {
    let inputs = [
        "", " ", ".", "..", "...", "./..", "/", "\\", "\t", "?", ". .", "a", "-", "_", "ä", "..a",
        "\u{200b}", "✓", ". ",
    ];
    for input in inputs {
        match sanitize_file_name(input) {
            Ok(s) => assert!(!s.is_empty() && s != "." && s != "..", "{input:?} -> {s:?}"),
            Err(CheckpointError::InvalidName(n)) => assert_eq!(n, input),
            Err(e) => panic!("unexpected error for {input:?}: {e}"),
        }
    }
}

// ============================================================================
// Annotation and materialization
// ============================================================================

#[test]
fn materialize_fills_from_split_and_second_call_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let reference = TinyModel::reference(16, 8, 2);
    save_pretrained_split(&reference, dir.path(), 0.02).unwrap();

    let mut model = TinyModel::new(16, 8, 2);
    nullify(&mut model);
    assert_eq!(model.nbytes(), 0);

    let mut registry = LazyRegistry::new();
    let annotated = registry.annotate_from_directory(&model, dir.path()).unwrap();
    assert_eq!(annotated, 6);
    assert_eq!(model.nbytes(), 0);

    let first = registry.materialize(&mut model);
    assert_eq!(first.resolved, 6);
    assert!(first.is_complete());
    assert!(registry.is_empty());
    assert_same_weights(&reference, &model);
    assert_eq!(model.head.in_features(), Some(8));

    let second = registry.materialize(&mut model);
    assert_eq!(second.resolved, 0);
    assert!(second.failed.is_empty());
    assert_same_weights(&reference, &model);
}

#[test]
fn materialize_holds_at_most_one_parameter_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let reference = TinyModel::reference(64, 32, 4);
    save_pretrained_split(&reference, dir.path(), 0.02).unwrap();
    let final_bytes = reference.nbytes();
    let max_param = reference
        .named_parameters()
        .iter()
        .map(|(_, p)| p.nbytes())
        .max()
        .unwrap();

    let mut model = TinyModel::new(64, 32, 4);
    nullify(&mut model);
    let mut registry = LazyRegistry::new();
    registry.annotate_from_directory(&model, dir.path()).unwrap();

    let base = alloc::live_bytes();
    alloc::reset_peak();
    registry.materialize(&mut model).into_result().unwrap();
    let peak = alloc::peak_bytes() - base;

    assert_eq!(alloc::live_bytes() - base, final_bytes);
    // Loaded parameters, plus the source tensor and the fresh storage of
    // the one parameter being filled.
    assert!(
        peak <= final_bytes + 2 * max_param,
        "peak {peak} exceeds {final_bytes} + 2 * {max_param}"
    );
    assert!(peak < 2 * final_bytes);
}

#[test]
fn empty_spec_with_zero_std_materializes_zeros() {
    let dir = tempfile::tempdir().unwrap();
    save_split(
        &[(
            "weight".to_string(),
            SplitEntry::from(EmptySpec::new([4, 4], DType::F32, 0.0)),
        )],
        dir.path(),
    )
    .unwrap();

    let mut layer = Linear::from_params(Param::uninitialized(DType::F32), None);
    let mut registry = LazyRegistry::new();
    registry.annotate_from_directory(&layer, dir.path()).unwrap();
    assert!(matches!(
        registry.pending("weight"),
        Some(DeferredSource::EmptyFile(_))
    ));

    registry.materialize(&mut layer).into_result().unwrap();
    let w = layer.weight().tensor().unwrap();
    assert_eq!(w.shape().dims(), &[4, 4]);
    assert_eq!(w.dtype(), DType::F32);
    assert!(w.as_f32_slice().unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn empty_spec_with_unit_std_is_standard_normal() {
    let mut layer = Linear::from_params(Param::uninitialized(DType::F32), None);
    let mut registry = LazyRegistry::new();
    registry.defer(
        "weight",
        DeferredSource::Distribution(EmptySpec::new([256, 256], DType::F32, 1.0)),
    );
    registry
        .materialize_with_rng(&mut layer, &mut StdRng::seed_from_u64(42))
        .into_result()
        .unwrap();

    let data = layer.weight().tensor().unwrap().to_f32_vec();
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    assert!(mean.abs() < 0.02, "mean {mean}");
    assert!((var.sqrt() - 1.0).abs() < 0.02, "std {}", var.sqrt());
}

#[test]
fn partial_manifest_leaves_missing_params_unbacked() {
    let dir = tempfile::tempdir().unwrap();
    let reference = TinyModel::reference(16, 8, 2);
    let entries: Vec<(String, SplitEntry)> = reference
        .state_dict()
        .into_iter()
        .filter(|(name, _)| !name.starts_with("blocks.1"))
        .map(|(name, t)| (name, SplitEntry::from(t)))
        .collect();
    save_split(&entries, dir.path()).unwrap();

    let mut model = TinyModel::new(16, 8, 2);
    nullify(&mut model);
    let mut registry = LazyRegistry::new();
    assert_eq!(registry.annotate_from_directory(&model, dir.path()).unwrap(), 4);

    let report = registry.materialize(&mut model);
    assert_eq!(report.resolved, 4);
    assert!(report.is_complete());
    assert!(model.blocks[1].weight().is_lazy());
    assert!(model.blocks[1].bias().unwrap().is_lazy());
    assert!(!model.blocks[0].weight().is_lazy());
    assert_eq!(model.num_lazy(), 2);
}

#[test]
fn partial_dict_consumes_only_applied_keys() {
    let reference = TinyModel::reference(16, 8, 2);
    let mut state_dict: HashMap<String, Tensor> = reference
        .state_dict()
        .into_iter()
        .filter(|(name, _)| name != "head.weight")
        .collect();
    state_dict.insert("unrelated.weight".to_string(), Tensor::ones(&[3]));

    let mut model = TinyModel::new(16, 8, 2);
    nullify(&mut model);
    let loaded = LazyRegistry::new()
        .annotate_from_dict(&mut model, &mut state_dict)
        .unwrap();

    assert_eq!(loaded, 5);
    assert_eq!(state_dict.len(), 1);
    assert!(state_dict.contains_key("unrelated.weight"));
    assert!(model.head.weight().is_lazy());
    assert_eq!(model.head.in_features(), None);
    assert_eq!(model.num_lazy(), 1);
}

#[test]
fn missing_file_fails_alone_and_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let reference = TinyModel::reference(16, 8, 1);
    let manifest = save_pretrained_split(&reference, dir.path(), 0.02).unwrap();

    let mut model = TinyModel::new(16, 8, 1);
    nullify(&mut model);
    let mut registry = LazyRegistry::new();
    registry.annotate_from_directory(&model, dir.path()).unwrap();

    let victim = dir.path().join(manifest.get("blocks.0.weight").unwrap());
    let saved = std::fs::read(&victim).unwrap();
    std::fs::remove_file(&victim).unwrap();

    let report = registry.materialize(&mut model);
    assert_eq!(report.resolved, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "blocks.0.weight");
    assert!(matches!(report.failed[0].1, CheckpointError::MissingFile(_)));
    assert!(model.blocks[0].weight().is_lazy());
    assert_eq!(registry.names(), vec!["blocks.0.weight"]);

    std::fs::write(&victim, saved).unwrap();
    let retry = registry.materialize(&mut model);
    assert_eq!(retry.resolved, 1);
    assert!(registry.is_empty());
    assert_same_weights(&reference, &model);
}

#[test]
fn malformed_empty_spec_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let reference = TinyModel::reference(16, 8, 1);
    let entries: Vec<(String, SplitEntry)> = reference
        .state_dict()
        .into_iter()
        .map(|(name, t)| {
            let entry = if name == "blocks.0.weight" {
                SplitEntry::from(EmptySpec::new([8, 8], DType::F32, 0.0))
            } else {
                SplitEntry::from(t)
            };
            (name, entry)
        })
        .collect();
    let manifest = save_split(&entries, dir.path()).unwrap();
    let spec_file = dir.path().join(manifest.get("blocks.0.weight").unwrap());
    assert!(spec_file.to_string_lossy().ends_with(".empty_json"));

    let mut model = TinyModel::new(16, 8, 1);
    nullify(&mut model);
    let mut registry = LazyRegistry::new();
    registry.annotate_from_directory(&model, dir.path()).unwrap();

    std::fs::write(&spec_file, "{\"shape\": [8, 8], \"torch_dtype\":").unwrap();
    let report = registry.materialize(&mut model);
    assert_eq!(report.resolved, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "blocks.0.weight");
    assert!(matches!(report.failed[0].1, CheckpointError::Format { .. }));
    assert!(model.blocks[0].weight().is_lazy());
    assert!(!model.blocks[0].bias().unwrap().is_lazy());

    // A shape whose element count overflows is rejected the same way.
    std::fs::write(
        &spec_file,
        r#"{"shape": [4294967296, 4294967296, 2], "torch_dtype": "float32", "init_std": 1.0}"#,
    )
    .unwrap();
    let report = registry.materialize(&mut model);
    assert_eq!(report.resolved, 0);
    assert!(matches!(report.failed[0].1, CheckpointError::Format { .. }));
    assert_eq!(registry.names(), vec!["blocks.0.weight"]);

    std::fs::write(
        &spec_file,
        r#"{"shape": [8, 8], "torch_dtype": "float32", "init_std": 0.0}"#,
    )
    .unwrap();
    registry.materialize(&mut model).into_result().unwrap();
    assert!(registry.is_empty());
    assert_eq!(model.num_lazy(), 0);
}

// ============================================================================
// Pretrained loading
// ============================================================================

#[test]
fn from_pretrained_split_directory_is_deferred() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let reference = TinyModel::reference(16, 8, 2);
    save_pretrained_split(&reference, &root.path().join(CHECKPOINT_NAME), 0.02).unwrap();

    let mut model = from_pretrained::<TinyModel>(root.path()).unwrap();
    assert_eq!(model.registry().len(), 6);
    assert_eq!(model.module().nbytes(), 0);
    assert!(!model.is_materialized());

    model.materialize().into_result().unwrap();
    assert!(model.is_materialized());
    let model = model.into_inner().unwrap();
    assert_same_weights(&reference, &model);
}

#[test]
fn from_pretrained_single_file_is_eager() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let reference = TinyModel::reference(16, 8, 2);
    serialization::save_module(&reference, &root.path().join(CHECKPOINT_NAME)).unwrap();

    let model = from_pretrained::<TinyModel>(root.path()).unwrap();
    assert!(model.registry().is_empty());
    assert!(model.is_materialized());
    assert_same_weights(&reference, &*model);
}

#[test]
fn from_pretrained_reports_missing_pieces() {
    let root = tempfile::tempdir().unwrap();
    match from_pretrained::<TinyModel>(root.path()) {
        Err(CheckpointError::NotFound(p)) => assert!(p.ends_with(CONFIG_NAME)),
        other => panic!("expected missing config, got {:?}", other.err()),
    }

    write_config(root.path());
    match from_pretrained::<TinyModel>(root.path()) {
        Err(CheckpointError::NotFound(p)) => assert!(p.ends_with(CHECKPOINT_NAME)),
        other => panic!("expected missing checkpoint, got {:?}", other.err()),
    }
}

#[test]
fn into_inner_refuses_unresolved_parameters() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let reference = TinyModel::reference(16, 8, 2);
    save_pretrained_split(&reference, &root.path().join(CHECKPOINT_NAME), 0.02).unwrap();

    let model = from_pretrained::<TinyModel>(root.path()).unwrap();
    match model.into_inner() {
        Err(CheckpointError::Unresolved(names)) => {
            assert_eq!(names.len(), 6);
            assert_eq!(names[0], "blocks.0.bias");
        }
        other => panic!("expected Unresolved, got {:?}", other.err()),
    }
}

#[test]
fn wrapping_model_loads_through_inner_names() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let reference = TinyModel::reference(16, 8, 2);
    save_pretrained_split(&reference, &root.path().join(CHECKPOINT_NAME), 0.02).unwrap();

    let mut wrapper = from_pretrained::<Wrapper>(root.path()).unwrap();
    assert_eq!(wrapper.registry().len(), 6);
    assert!(wrapper.registry().pending("embed.weight").is_some());
    assert!(wrapper.registry().pending("inner.embed.weight").is_none());

    wrapper.materialize().into_result().unwrap();
    assert_same_weights(&reference, &wrapper.inner);
    // The full tree sees the same parameters under the wrapper's prefix.
    assert_eq!(wrapper.named_parameters()[0].0, "inner.embed.weight");
}

#[test]
fn placeholder_checkpoint_round_trips_through_empty_specs() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let mut blank = TinyModel::reference(16, 8, 2);
    nullify(&mut blank);
    let manifest =
        save_pretrained_split(&blank, &root.path().join(CHECKPOINT_NAME), 0.0).unwrap();
    assert!(manifest.iter().all(|(_, f)| f.ends_with(".empty_json")));

    let mut model = from_pretrained::<TinyModel>(root.path()).unwrap();
    model.materialize().into_result().unwrap();
    assert_eq!(model.head.in_features(), Some(8));
    assert!(model
        .named_parameters()
        .iter()
        .all(|(_, p)| p.tensor().unwrap().to_f32_vec().iter().all(|&v| v == 0.0)));
}

#[test]
fn loaded_model_decodes_like_the_original() {
    let root = tempfile::tempdir().unwrap();
    write_config(root.path());
    let mut reference = TinyModel::reference(16, 8, 2);
    save_pretrained_split(&reference, &root.path().join(CHECKPOINT_NAME), 0.02).unwrap();

    let mut loaded = from_pretrained::<TinyModel>(root.path()).unwrap();
    loaded.materialize().into_result().unwrap();
    let mut loaded = loaded.into_inner().unwrap();

    let expected = greedy_search(&mut reference, &[1, 2, 3], 8, 0).unwrap();
    let got = greedy_search(&mut loaded, &[1, 2, 3], 8, 0).unwrap();
    assert_eq!(got, expected);
    assert_eq!(got.len(), 8);
}
