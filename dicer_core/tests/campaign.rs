use dicer_core::classify::{Classifier, Outcome, Tally};
use dicer_core::config::{DicerConfig, GenerationSettings};
use dicer_core::executor::{CommandExecutor, CommandExecutorConfig, Executor, InProcessExecutor};
use dicer_core::helpers::HelperRegistry;
use dicer_core::item::{FieldItem, Item};
use dicer_core::provider::{DirectoryProvider, Provider};
use dicer_core::value::{FieldPath, Value};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn demo_provider(settings: &GenerationSettings) -> DirectoryProvider {
    DirectoryProvider::load(
        &workspace_root().join("demos/mkdisk"),
        HelperRegistry::with_builtins(),
        settings,
    )
    .unwrap()
}

fn field(item: &FieldItem, raw: &str) -> Option<Value> {
    item.get(&raw.parse::<FieldPath>().unwrap())
}

/// Mirrors `test_targets/mkdisk.sh`.
fn mkdisk_harness(item: &FieldItem) -> Result<(), String> {
    let size = field(item, "size").and_then(|v| v.as_int());
    match size {
        Some(n) if n > 0 => {}
        Some(n) => return Err(format!("mkdisk: invalid size {n}")),
        None => return Err("mkdisk: size must be a number".to_string()),
    }
    let mode = field(item, "mode").map(|v| v.to_string()).unwrap_or_default();
    if mode != "ro" && mode != "rw" {
        return Err(format!("mkdisk: unknown mode '{mode}'"));
    }
    if field(item, "label").is_some_and(|l| l.to_string().is_empty()) {
        return Err("mkdisk: empty label".to_string());
    }
    Ok(())
}

#[test]
fn agreeing_target_only_produces_success_and_expected_neg() {
    let settings = GenerationSettings {
        fail_ratio: 0.3,
        ..GenerationSettings::default()
    };
    let provider = demo_provider(&settings);
    let mut executor = InProcessExecutor::new(mkdisk_harness);
    let mut classifier = Classifier::new();
    let mut tally = Tally::default();
    let mut rng = ChaCha8Rng::seed_from_u64(201);

    for _ in 0..400 {
        let (item, _) = provider.generate_with_retries(&mut rng, 5).unwrap();
        let result = executor.execute_sync(&item);
        let classification = classifier.classify(&result, item.fail_patts());
        assert!(
            matches!(classification.outcome, Outcome::Success | Outcome::ExpectedNeg),
            "{} for {item:?}: {}",
            classification.outcome,
            result.output.stderr_lossy()
        );
        tally.record(classification.outcome);
    }
    assert!(tally.count(Outcome::Success) > 0, "{tally}");
    assert!(tally.count(Outcome::ExpectedNeg) > 0, "{tally}");
    assert_eq!(tally.findings(), 0);
}

#[test]
fn disagreeing_target_is_reported() {
    let provider = demo_provider(&GenerationSettings::default());
    let mut lenient = InProcessExecutor::new(|_: &FieldItem| Ok::<(), String>(()));
    let mut strict = InProcessExecutor::new(|_: &FieldItem| {
        Err::<(), String>("mkdisk: disk on fire".to_string())
    });
    let mut classifier = Classifier::new();
    let mut rng = ChaCha8Rng::seed_from_u64(202);

    let mut saw = Vec::new();
    for _ in 0..200 {
        let (item, _) = provider.generate_with_retries(&mut rng, 5).unwrap();
        let expect_fail = !item.fail_patts().is_empty();

        let passed = classifier.classify(&lenient.execute_sync(&item), item.fail_patts());
        let failed = classifier.classify(&strict.execute_sync(&item), item.fail_patts());
        if expect_fail {
            assert_eq!(passed.outcome, Outcome::UnexpectedPass);
            assert_eq!(failed.outcome, Outcome::UnexpectedNeg);
        } else {
            assert_eq!(passed.outcome, Outcome::Success);
            assert_eq!(failed.outcome, Outcome::Failure);
        }
        saw.push(expect_fail);
    }
    assert!(saw.contains(&true) && saw.contains(&false));
}

#[cfg(unix)]
#[test]
fn demo_campaign_against_the_shell_target() {
    let root = workspace_root();
    let config = DicerConfig::load_from_file(&root.join("demos/mkdisk/dicer.toml")).unwrap();
    let provider = DirectoryProvider::load(
        &root.join(&config.target.provider_dirs[0]),
        HelperRegistry::with_builtins(),
        &config.generation,
    )
    .unwrap();
    let mut executor = CommandExecutor::new(CommandExecutorConfig {
        command: config.target.command.clone(),
        timeout: config.target.timeout(),
        working_dir: Some(root.clone()),
    });
    let mut classifier = Classifier::new();
    let mut tally = Tally::default();
    let mut rng = ChaCha8Rng::seed_from_u64(203);

    for _ in 0..60 {
        let (item, _) = provider
            .generate_with_retries(&mut rng, config.fuzzer.max_retries)
            .unwrap();
        let result = executor.execute_sync(&item);
        let classification = classifier.classify(&result, item.fail_patts());
        assert!(
            matches!(classification.outcome, Outcome::Success | Outcome::ExpectedNeg),
            "{} for {:?}: {}",
            classification.outcome,
            executor.command_line(&item),
            result.output.stderr_lossy()
        );
        tally.record(classification.outcome);
    }
    assert_eq!(tally.total(), 60);
    assert!(tally.count(Outcome::Success) > 0, "{tally}");
}

#[cfg(unix)]
#[test]
fn hanging_target_times_out() {
    let root = workspace_root();
    let mut executor = CommandExecutor::new(CommandExecutorConfig {
        command: vec!["sh".into(), "test_targets/hang.sh".into()],
        timeout: std::time::Duration::from_millis(200),
        working_dir: Some(root),
    });
    let mut classifier = Classifier::new();
    let item = FieldItem::new();
    let result = executor.execute_sync(&item);
    assert_eq!(classifier.classify(&result, item.fail_patts()).outcome, Outcome::Timeout);
}
