use std::path::{Path, PathBuf};

use super::ChromeError;

/// Find a Chromium executable, checking an explicit override path first,
/// then platform well-known locations.
///
/// # Errors
///
/// Returns `ChromeError::NotFound` if neither the override nor any
/// candidate path exists.
pub fn find_chromium_executable(override_path: Option<&Path>) -> Result<PathBuf, ChromeError> {
    if let Some(p) = override_path {
        if p.exists() {
            return Ok(p.to_path_buf());
        }
        return Err(ChromeError::NotFound(format!(
            "requested executable does not exist: {}",
            p.display()
        )));
    }

    for candidate in chromium_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ChromeError::NotFound(
        "no Chromium executable in any well-known location".into(),
    ))
}

/// The default Chrome user data directory for the current platform, rooted
/// in the platform-conventional application-support / config / local-app-data
/// directory. This is the only environment consultation the server performs.
#[must_use]
pub fn default_user_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::config_dir().map(|d| d.join("Google/Chrome"))
    }

    #[cfg(target_os = "linux")]
    {
        let config = dirs::config_dir()?;
        let chrome = config.join("google-chrome");
        if chrome.exists() {
            return Some(chrome);
        }
        Some(config.join("chromium"))
    }

    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir().map(|d| d.join("Google").join("Chrome").join("User Data"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

/// All candidate executable paths on the current platform, most specific
/// first.
fn chromium_candidates() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
            PathBuf::from("/Applications/Brave Browser.app/Contents/MacOS/Brave Browser"),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        let path_dirs: Vec<PathBuf> = std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .map(PathBuf::from)
            .collect();

        let names = [
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ];

        let mut candidates = Vec::new();
        for name in names {
            for dir in &path_dirs {
                candidates.push(dir.join(name));
            }
        }
        candidates
    }

    #[cfg(target_os = "windows")]
    {
        let mut candidates = Vec::new();
        for base in [
            std::env::var("ProgramFiles").ok(),
            std::env::var("ProgramFiles(x86)").ok(),
        ]
        .into_iter()
        .flatten()
        {
            candidates.push(PathBuf::from(&base).join("Google/Chrome/Application/chrome.exe"));
            candidates.push(PathBuf::from(&base).join("Chromium/Application/chrome.exe"));
        }
        if let Some(local) = dirs::data_local_dir() {
            candidates.push(local.join("Google/Chrome/Application/chrome.exe"));
            candidates.push(local.join("Chromium/Application/chrome.exe"));
        }
        candidates
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_is_not_empty() {
        assert!(!chromium_candidates().is_empty());
    }

    #[test]
    fn override_existing_file_wins() {
        let exe = std::env::current_exe().unwrap();
        let found = find_chromium_executable(Some(&exe)).unwrap();
        assert_eq!(found, exe);
    }

    #[test]
    fn override_missing_file_is_an_error() {
        let fake = Path::new("/nonexistent/chromium-override");
        let result = find_chromium_executable(Some(fake));
        assert!(matches!(result, Err(ChromeError::NotFound(_))));
    }

    #[test]
    fn default_user_data_dir_is_under_config_root() {
        // The directory itself need not exist on a CI machine; the path
        // must still be derivable from platform conventions.
        if let Some(dir) = default_user_data_dir() {
            assert!(dir.is_absolute());
        }
    }
}
