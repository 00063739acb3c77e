mod utils;

use std::path::Path;

use tract_convert::pipeline::format_names;
use tract_convert::prelude::*;

use utils::*;

const MODEL: &str = "sqnxt23v5_w2";
const OTHER_MODEL: &str = "sqnxt23_w1";

/// A zoo whose cache holds the tiny classifier under a registered name.
fn zoo(dir: &Path) -> ModelZoo {
    let zoo = ModelZoo::new(dir.join("zoo"));
    std::fs::create_dir_all(zoo.cache_dir()).unwrap();
    write_model(&tiny_classifier(), zoo.path_for(MODEL));
    zoo
}

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        model: MODEL.to_string(),
        size: 16,
        output_dir: dir.join("out"),
        seed: Some(42),
        ..PipelineConfig::default()
    }
}

#[test]
fn seeded_conversion_twice() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let zoo = zoo(dir.path());
    let pipeline = Pipeline::new(config(dir.path()));
    let first = pipeline.run(&zoo).unwrap();
    let second = pipeline.run(&zoo).unwrap();
    assert!(first.discrepancy.within(1e-4), "{:?}", first.discrepancy);
    assert!(second.discrepancy.within(1e-4), "{:?}", second.discrepancy);
    assert_eq!(first.discrepancy, second.discrepancy);
}

#[test]
fn unseeded_runs_are_equivalent_too() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let zoo = zoo(dir.path());
    let pipeline = Pipeline::new(PipelineConfig { seed: None, ..config(dir.path()) });
    for _ in 0..2 {
        let report = pipeline.run(&zoo).unwrap();
        assert!(report.discrepancy.within(1e-4), "{:?}", report.discrepancy);
    }
}

#[test]
fn frozen_graph_reloads() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig { verify: true, ..config(dir.path()) };
    let report = Pipeline::new(config).run(&zoo(dir.path())).unwrap();
    let verified = report.verified.unwrap();
    assert!(verified.within(1e-4), "{:?}", verified);

    assert_eq!(report.path, dir.path().join("out/saved_model.pb"));
    let frozen = read_graph(&report.path).unwrap();
    assert!(frozen.node.iter().all(|n| n.op != "VariableV2" && n.op != "Assign"));
    assert!(frozen.node.iter().all(|n| n.device.is_empty()));
    assert_eq!(frozen.node.iter().filter(|n| n.op == "Placeholder").count(), 1);
    assert!(frozen.node.iter().any(|n| n.name == report.output_names[0]));
}

#[test]
fn unknown_model_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig { model: "sqnxt_9000".to_string(), ..config(dir.path()) };
    let err = Pipeline::new(config.clone()).run(&zoo(dir.path())).unwrap_err();
    assert!(matches!(err.downcast_ref::<ZooError>(), Some(ZooError::UnknownModel(_))));
    assert!(!config.output_path().exists());
    assert!(!config.output_dir.exists());
}

#[test]
fn successive_runs_overwrite() {
    setup_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let zoo = zoo(dir.path());
    write_model(&tiny_classifier_with_salt(5), zoo.path_for(OTHER_MODEL));
    let config = config(dir.path());
    std::fs::create_dir_all(&config.output_dir).unwrap();
    std::fs::write(config.output_path(), b"stale content").unwrap();

    let first = Pipeline::new(config.clone()).run(&zoo).unwrap();
    let first_graph = read_graph(&first.path).unwrap();
    let other = PipelineConfig { model: OTHER_MODEL.to_string(), verify: true, ..config.clone() };
    let second = Pipeline::new(other).run(&zoo).unwrap();
    assert_eq!(first.path, second.path);
    assert_ne!(read_graph(&second.path).unwrap(), first_graph);
    let verified = second.verified.unwrap();
    assert!(verified.within(1e-4), "{:?}", verified);

    let text = Pipeline::new(PipelineConfig { as_text: true, ..config }).run(&zoo).unwrap();
    let content = std::fs::read_to_string(&text.path).unwrap();
    assert!(content.starts_with("node {"));
}

#[test]
fn console_contract() {
    let dir = tempfile::tempdir().unwrap();
    let report = Pipeline::new(config(dir.path())).run(&zoo(dir.path())).unwrap();
    let console = report.console();
    let lines: Vec<&str> = console.lines().collect();
    assert!(lines[0].starts_with("Error: "));
    assert!(lines[0]["Error: ".len()..].parse::<f32>().is_ok());
    assert!(console.contains("Total params: "));
    assert!(console.contains("Non-trainable params: 16"));
    assert_eq!(lines.last().unwrap(), &format_names(&report.output_names));
    assert_eq!(report.output_names.len(), 1);
    assert!(report.output_names[0].starts_with("LAYER_"));
    assert!(report.output_names[0].ends_with("/Softmax"));
}

#[test]
fn model_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classifier.onnx");
    write_model(&tiny_classifier(), &path);
    let config = PipelineConfig {
        model: "classifier".to_string(),
        model_path: Some(path),
        ..config(dir.path())
    };
    let report = Pipeline::new(config).run(&ModelZoo::new(dir.path().join("empty"))).unwrap();
    assert_eq!(report.model, "classifier");
    assert!(report.discrepancy.within(1e-4));
}

#[test]
fn registered_but_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let empty = ModelZoo::new(dir.path().join("empty"));
    let err = Pipeline::new(config(dir.path())).run(&empty).unwrap_err();
    assert!(matches!(err.downcast_ref::<ZooError>(), Some(ZooError::NotCached { .. })));
    assert!(tract_convert::zoo::entry(MODEL).is_ok());
}
