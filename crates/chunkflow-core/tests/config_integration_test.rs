use chunkflow_core::{
    BoundaryRule, ConfigManager, DependencyRule, MethodologyRegistry, PrecedenceRule, Settings,
    StorageBackend, TieBreak,
};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_configuration() {
    let settings = Settings::default();
    assert!(settings.validate().is_ok());
    assert!(settings.pool.workers > 0);
    assert_eq!(settings.storage.backend, StorageBackend::Memory);
}

#[test]
fn test_layered_files() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        r#"
[pool]
workers = 2

[chunking]
max_chunk_bytes = 4096

[coordinator]
max_retries = 5
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("testing.toml"),
        r#"
[coordinator]
max_retries = 1
dispatch_timeout_ms = 250
"#,
    )
    .unwrap();

    let settings = ConfigManager::load_from_sources(dir.path(), "testing").unwrap();
    assert_eq!(settings.pool.workers, 2);
    assert_eq!(settings.chunking.max_chunk_bytes, 4096);
    assert_eq!(settings.coordinator.max_retries, 1);
    assert_eq!(settings.coordinator.dispatch_timeout_ms, 250);
}

#[test]
fn test_methodologies_from_config() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        r###"
[[methodologies]]
name = "chapters"
version = 3
domain = "books"
max_chunk_bytes = 2048
dependencies = "unit_order"
catalog_levels = ["project", "domain"]
boundary = { kind = "sections", marker = "##" }
precedence = { kind = "higher_confidence", tie_break = "earlier" }
"###,
    )
    .unwrap();

    let settings = ConfigManager::load_from_sources(dir.path(), "none").unwrap();
    assert_eq!(settings.methodologies.len(), 1);
    let m = &settings.methodologies[0];
    assert_eq!(
        m.boundary,
        BoundaryRule::Sections {
            marker: "##".into()
        }
    );
    assert_eq!(m.dependencies, DependencyRule::UnitOrder);
    assert_eq!(
        m.precedence,
        PrecedenceRule::HigherConfidence {
            tie_break: Some(TieBreak::Earlier)
        }
    );

    let registry = MethodologyRegistry::with_builtins(settings.chunking.max_chunk_bytes);
    registry.register(m.clone()).unwrap();
    assert_eq!(registry.resolve("chapters").unwrap().version, 3);
}

#[test]
fn test_invalid_configuration_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        r#"
[pool]
workers = 0
"#,
    )
    .unwrap();
    assert!(ConfigManager::load_from_sources(dir.path(), "none").is_err());
}
