//! Integration tests for file-backed shared state on the real file system

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_arch_core::DependencyValues;
use composable_arch_shared::{FileStorageConfig, FileStorageKey, LiveFileStorage, Shared};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Settings {
    theme: String,
    font_size: u8,
}

fn key(path: &Path, debounce: Duration) -> FileStorageKey<Settings> {
    FileStorageKey::with_storage(path, Arc::new(LiveFileStorage::default()))
        .with_config(FileStorageConfig::default().with_write_debounce(debounce))
}

fn read(path: &Path) -> Option<Settings> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn pending_write_is_flushed_when_the_last_reference_drops() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    DependencyValues::test().enter(|| {
        let settings = Shared::with_key(Settings::default(), key(&path, Duration::from_secs(60)));
        settings.with_lock(|settings| settings.theme = "dark".into());
        assert!(!path.exists(), "write should wait for the debounce");

        drop(settings);
        assert_eq!(read(&path).map(|settings| settings.theme), Some("dark".to_string()));
    });
}

#[test]
fn stored_value_is_loaded_by_the_next_reference() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("settings.json");

    DependencyValues::test().enter(|| {
        let settings = Shared::with_key(Settings::default(), key(&path, Duration::from_secs(60)));
        settings.set(Settings {
            theme: "solarized".into(),
            font_size: 14,
        });
        drop(settings);

        let reloaded = Shared::with_key(Settings::default(), key(&path, Duration::from_secs(60)));
        assert_eq!(reloaded.get().font_size, 14);
        assert_eq!(reloaded.get().theme, "solarized");
    });
}

#[tokio::test]
async fn rapid_saves_are_coalesced_into_the_latest_value() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let settings = DependencyValues::test().enter(|| {
        Shared::with_key(Settings::default(), key(&path, Duration::from_millis(50)))
    });
    for size in 1..=5 {
        settings.with_lock(|settings| settings.font_size = size);
    }
    assert!(!path.exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(read(&path).map(|settings| settings.font_size), Some(5));
    drop(settings);
}

#[test]
fn external_edits_are_picked_up() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    DependencyValues::test().enter(|| {
        let settings = Shared::with_key(Settings::default(), key(&path, Duration::from_secs(60)));

        let edited = Settings {
            theme: "light".into(),
            font_size: 11,
        };
        std::fs::write(&path, serde_json::to_vec(&edited).unwrap()).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || settings.get() == edited),
            "external edit was not observed"
        );
    });
}

#[test]
fn corrupt_file_falls_back_to_the_initial_value() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "not json").unwrap();

    DependencyValues::test().enter(|| {
        let initial = Settings {
            theme: "default".into(),
            font_size: 12,
        };
        let settings = Shared::with_key(initial.clone(), key(&path, Duration::from_secs(60)));
        assert_eq!(settings.get(), initial);
    });
}
