// External media tools (ffmpeg, ffprobe).
//
// Lookup order: EVIDENCECAM_FFMPEG_PATH / EVIDENCECAM_FFPROBE_PATH, a copy
// shipped next to the executable (or in its bin/ folder), then plain PATH.

use std::env;
use std::path::PathBuf;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        }
    }

    fn env_key(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "EVIDENCECAM_FFMPEG_PATH",
            Tool::Ffprobe => "EVIDENCECAM_FFPROBE_PATH",
        }
    }

    pub fn path(&self) -> PathBuf {
        locate(self.env_key(), self.name())
    }

    pub fn command(&self) -> Command {
        Command::new(self.path())
    }

    /// First line of `-version`, or None if the tool does not run.
    pub fn version(&self) -> Option<String> {
        let output = self.command().arg("-version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
    }

    pub fn is_available(&self) -> bool {
        self.path().is_file() || self.version().is_some()
    }
}

fn locate(env_key: &str, name: &str) -> PathBuf {
    if let Some(p) = env::var_os(env_key).map(PathBuf::from) {
        if p.is_file() {
            return p;
        }
        log::warn!("{} points at {}, which does not exist", env_key, p.display());
    }

    let file_name = if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() };
    let bundled = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.to_path_buf()))
        .into_iter()
        .flat_map(|dir| [dir.join(&file_name), dir.join("bin").join(&file_name)])
        .find(|p| p.is_file());

    bundled.unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falls_back_to_bare_name() {
        assert_eq!(locate("EVIDENCECAM_TEST_UNSET_TOOL", "nosuchtool"), PathBuf::from("nosuchtool"));
    }

    #[test]
    fn test_env_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("my-ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();

        env::set_var("EVIDENCECAM_TEST_TOOL_PATH", &fake);
        assert_eq!(locate("EVIDENCECAM_TEST_TOOL_PATH", "ffmpeg"), fake);
        env::remove_var("EVIDENCECAM_TEST_TOOL_PATH");
    }

    #[test]
    fn test_missing_override_is_ignored() {
        env::set_var("EVIDENCECAM_TEST_TOOL_MISSING", "/nonexistent/ffprobe");
        assert_eq!(locate("EVIDENCECAM_TEST_TOOL_MISSING", "ffprobe"), PathBuf::from("ffprobe"));
        env::remove_var("EVIDENCECAM_TEST_TOOL_MISSING");
    }
}
