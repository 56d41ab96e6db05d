//! Integration tests for ckpt-prune using small synthetic checkpoints.

use checkpoint_storage::{formats, Checkpoint, Dtype, Tensor, TensorMap};
use half::f16;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn ckpt_prune() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ckpt-prune"))
}

fn run(args: &[&str]) -> Output {
    ckpt_prune().args(args).output().expect("Failed to run ckpt-prune")
}

fn assert_success(output: &Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "ckpt-prune failed:\nstdout: {}\nstderr: {}", stdout, stderr);
}

fn f32_tensor(values: &[f32]) -> Tensor {
    Tensor::from_f32(vec![values.len()], values).unwrap()
}

/// A miniature SD checkpoint with all four sub-models, EMA copies and
/// training leftovers.
fn sd_tensors() -> TensorMap {
    let mut map = TensorMap::new();
    map.insert("model.diffusion_model.input_blocks.0.weight".into(), f32_tensor(&[1.0, 2.0]));
    map.insert("model.diffusion_model.out.2.bias".into(), f32_tensor(&[3.0]));
    map.insert("model_ema.diffusion_modelinput_blocks0weight".into(), f32_tensor(&[10.0, 20.0]));
    map.insert("model_ema.num_updates".into(), f32_tensor(&[1000.0]));
    map.insert("depth_model.pretrained.conv.weight".into(), f32_tensor(&[4.0]));
    map.insert("first_stage_model.decoder.norm.weight".into(), f32_tensor(&[5.0]));
    map.insert("cond_stage_model.transformer.embeddings".into(), f32_tensor(&[6.0, 7.0]));
    map.insert(
        "cond_stage_model.transformer.position_ids".into(),
        Tensor::new(Dtype::I64, vec![2], [0i64, 1].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>()).unwrap(),
    );
    map.insert("optimizer.exp_avg".into(), f32_tensor(&[0.1]));
    map
}

fn write_fixture(dir: &Path, name: &str, checkpoint: &Checkpoint) -> String {
    let path = dir.join(name);
    formats::save(checkpoint, &path).unwrap();
    path.to_str().unwrap().to_string()
}

fn f16_values(tensor: &Tensor) -> Vec<f32> {
    assert_eq!(tensor.dtype(), Dtype::F16);
    tensor
        .data()
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect()
}

#[test]
fn test_missing_arguments_prints_usage() {
    let output = run(&[]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr.contains("error:"), "stderr: {}", stderr);
    assert!(stderr.contains("Usage"), "stderr: {}", stderr);
    assert!(stderr.contains("--no-clip"), "help text missing from stderr: {}", stderr);
    assert!(output.stdout.is_empty());
}

#[test]
fn test_unknown_flag_has_no_side_effects() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.safetensors", &Checkpoint::flat(sd_tensors()));
    let out = dir.path().join("out.safetensors");

    let output = run(&[input.as_str(), out.to_str().unwrap(), "--bogus"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(!out.exists());
}

#[test]
fn test_help_and_version() {
    let output = run(&["--help"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--fp16"));
    assert!(stdout.contains("--no-depth"));
    assert!(stdout.contains("Use EMA weights where available"));

    let output = run(&["--version"]);
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("ckpt-prune"));
}

#[test]
fn test_prune_safetensors_defaults() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.safetensors", &Checkpoint::flat(sd_tensors()));
    let out = dir.path().join("out.safetensors");

    let output = run(&[input.as_str(), out.to_str().unwrap()]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Dropped: 3"), "stdout: {}", stdout);

    let pruned = formats::load(&out).unwrap();
    let keys: Vec<&str> = pruned.tensors().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        [
            "cond_stage_model.transformer.embeddings",
            "cond_stage_model.transformer.position_ids",
            "depth_model.pretrained.conv.weight",
            "first_stage_model.decoder.norm.weight",
            "model.diffusion_model.input_blocks.0.weight",
            "model.diffusion_model.out.2.bias",
        ]
    );
    let original = sd_tensors();
    for (key, tensor) in pruned.tensors() {
        assert_eq!(tensor, &original[key], "{key} changed");
    }
}

#[test]
fn test_fp16_and_ema() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.safetensors", &Checkpoint::flat(sd_tensors()));
    let out = dir.path().join("out.safetensors");

    let output = run(&[input.as_str(), out.to_str().unwrap(), "-p", "-e"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("EMA weights used: 1"), "stdout: {}", stdout);
    assert!(stdout.contains("Cast to fp16: 6"), "stdout: {}", stdout);

    let pruned = formats::load(&out).unwrap();
    assert!(pruned.tensors().values().all(|t| t.dtype() == Dtype::F16));
    assert_eq!(
        f16_values(pruned.get("model.diffusion_model.input_blocks.0.weight").unwrap()),
        vec![10.0, 20.0]
    );
    // no EMA counterpart, base weight kept
    assert_eq!(f16_values(pruned.get("model.diffusion_model.out.2.bias").unwrap()), vec![3.0]);
    assert_eq!(
        f16_values(pruned.get("cond_stage_model.transformer.position_ids").unwrap()),
        vec![0.0, 1.0]
    );
}

#[test]
fn test_nested_torch_stays_nested() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.ckpt", &Checkpoint::nested(sd_tensors()));
    let out = dir.path().join("out.ckpt");

    let output = run(&[input.as_str(), out.to_str().unwrap(), "-c", "-a", "-d"]);
    assert_success(&output);

    let pruned = formats::load(&out).unwrap();
    assert!(pruned.is_nested());
    assert_eq!(pruned.len(), 2);
    assert!(pruned.tensors().keys().all(|k| k.starts_with("model.diffusion_model.")));
}

#[test]
fn test_all_groups_removed_gives_empty_state_dict() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.ckpt", &Checkpoint::nested(sd_tensors()));
    let out = dir.path().join("out.ckpt");

    let output = run(&[input.as_str(), out.to_str().unwrap(), "-c", "-a", "-d", "-u"]);
    assert_success(&output);

    let pruned = formats::load(&out).unwrap();
    assert!(pruned.is_nested());
    assert!(pruned.is_empty());
}

#[test]
fn test_torch_to_safetensors_conversion() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.ckpt", &Checkpoint::nested(sd_tensors()));
    let out = dir.path().join("out.safetensors");

    let output = run(&[input.as_str(), out.to_str().unwrap(), "--no-unet"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("(torch)"), "stdout: {}", stdout);
    assert!(stdout.contains("(safetensors)"), "stdout: {}", stdout);

    let pruned = formats::load(&out).unwrap();
    assert!(!pruned.is_nested());
    assert_eq!(pruned.len(), 4);
    assert!(pruned.get("model.diffusion_model.out.2.bias").is_none());
}

#[test]
fn test_config_file_with_flag_overrides() {
    let dir = TempDir::new().unwrap();
    let input = write_fixture(dir.path(), "in.safetensors", &Checkpoint::flat(sd_tensors()));
    let out = dir.path().join("out.safetensors");
    let config = dir.path().join("prune.json");
    fs::write(&config, r#"{"clip": false, "depth": false}"#).unwrap();

    let output = run(&[
        input.as_str(),
        out.to_str().unwrap(),
        "--config", config.to_str().unwrap(),
        "--no-vae",
    ]);
    assert_success(&output);

    let pruned = formats::load(&out).unwrap();
    assert_eq!(pruned.len(), 2);
    assert!(pruned.tensors().keys().all(|k| k.starts_with("model.diffusion_model.")));
    assert_eq!(pruned.get("model.diffusion_model.out.2.bias").unwrap().dtype(), Dtype::F32);
}

#[test]
fn test_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("missing.ckpt");
    let out = dir.path().join("out.ckpt");

    let output = run(&[input.to_str().unwrap(), out.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load checkpoint"), "stderr: {}", stderr);
    assert!(!out.exists());
}
