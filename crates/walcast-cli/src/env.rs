use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Load the closest .env file, searching from the current directory up to the
/// filesystem root. Returns the loaded path, or `None` when there is no .env file.
pub fn load_dotenv_from_ancestors() -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    for dir in cwd.ancestors() {
        let env_path = dir.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("Failed to load .env from {}", env_path.display()))?;
            info!("Loaded .env from {}", env_path.display());
            return Ok(Some(env_path));
        }
    }

    debug!(cwd = %cwd.display(), "No .env file found");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_load_dotenv_from_current_directory() {
        let temp_dir = TempDir::new().unwrap();
        let env_path = temp_dir.path().join(".env");
        fs::write(&env_path, "WALCAST_TEST_CURRENT=hello").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("WALCAST_TEST_CURRENT");

        let result = load_dotenv_from_ancestors();
        assert!(result.unwrap().is_some(), "Should find .env in current directory");
        assert_eq!(std::env::var("WALCAST_TEST_CURRENT").unwrap(), "hello");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_TEST_CURRENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_from_grandparent_directory() {
        let grandparent_dir = TempDir::new().unwrap();
        let child_dir = grandparent_dir.path().join("parent").join("child");
        fs::create_dir_all(&child_dir).unwrap();
        fs::write(
            grandparent_dir.path().join(".env"),
            "WALCAST_TEST_GRANDPARENT=nested",
        )
        .unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("WALCAST_TEST_GRANDPARENT");

        let result = load_dotenv_from_ancestors();
        assert!(result.unwrap().is_some(), "Should find .env in grandparent directory");
        assert_eq!(std::env::var("WALCAST_TEST_GRANDPARENT").unwrap(), "nested");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_TEST_GRANDPARENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_prefers_closest_env_file() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = parent_dir.path().join("subdir");
        fs::create_dir(&child_dir).unwrap();

        fs::write(parent_dir.path().join(".env"), "WALCAST_TEST_CLOSEST=parent").unwrap();
        fs::write(child_dir.join(".env"), "WALCAST_TEST_CLOSEST=child").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("WALCAST_TEST_CLOSEST");

        let loaded = load_dotenv_from_ancestors().unwrap().unwrap();
        assert!(loaded.ends_with("subdir/.env"));
        assert_eq!(
            std::env::var("WALCAST_TEST_CLOSEST").unwrap(),
            "child",
            "Should prefer .env in current directory over parent"
        );

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("WALCAST_TEST_CLOSEST");
    }
}
