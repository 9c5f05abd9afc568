//! Rule sets that decide whether an unpacked asset can be rendered.
//!
//! Each job kind owns an ordered list of requirements over the relative
//! paths of the unpacked asset. Every requirement must be met by at least
//! one path. The last requirement always identifies the job description
//! document, whose path is returned on success.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The authoring application an asset was produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Maya,
}

impl JobKind {
    pub fn rule(self) -> Box<dyn ManifestRule> {
        match self {
            JobKind::Maya => Box::new(MayaRule::new()),
        }
    }
}

/// A single condition over one relative path: a regular expression that
/// must match somewhere in it.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub name: &'static str,
    pattern: Regex,
}

impl Requirement {
    pub fn new(name: &'static str, pattern: &str) -> Result<Self, CoreError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| CoreError::Manifest(format!("bad pattern for {name}: {e}")))?;
        Ok(Self { name, pattern })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Validates the file list of an unpacked asset.
pub trait ManifestRule: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Ordered requirements; the last one selects the description document.
    fn requirements(&self) -> Result<&[Requirement], CoreError>;

    /// Check every requirement and return the description document path.
    fn validate(&self, paths: &[String]) -> Result<String, CoreError> {
        let requirements = self.requirements()?;
        let Some(description) = requirements.last() else {
            return Err(CoreError::Manifest(format!(
                "no requirements configured for {:?}",
                self.kind()
            )));
        };

        let missing: Vec<&str> = requirements
            .iter()
            .filter(|req| !paths.iter().any(|p| req.matches(p)))
            .map(|req| req.name)
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::Manifest(format!(
                "missing required entries: {}",
                missing.join(", ")
            )));
        }

        paths
            .iter()
            .find(|p| description.matches(p))
            .cloned()
            .ok_or_else(|| CoreError::Manifest("no description document".into()))
    }
}

// ── Maya ──────────────────────────────────────────────────────

/// `\w` is ASCII-only: `é.ma` is not a scene file.
const MAYA_PATTERNS: [(&str, &str); 4] = [
    ("workspace.mel", r"^workspace\.mel"),
    ("images/", r"^images/"),
    ("scene file (.ma/.mb)", r"(?-u:\w)+\.(ma|mb)"),
    ("top-level .xml", r"^(?-u:\w)+\.xml$"),
];

static MAYA_REQUIREMENTS: LazyLock<Result<Vec<Requirement>, String>> = LazyLock::new(|| {
    MAYA_PATTERNS
        .into_iter()
        .map(|(name, pattern)| Requirement::new(name, pattern).map_err(|e| e.to_string()))
        .collect()
});

/// Maya project layout: workspace file, images dir, a scene and a top-level xml.
#[derive(Debug, Clone, Copy, Default)]
pub struct MayaRule;

impl MayaRule {
    pub fn new() -> Self {
        Self
    }
}

impl ManifestRule for MayaRule {
    fn kind(&self) -> JobKind {
        JobKind::Maya
    }

    fn requirements(&self) -> Result<&[Requirement], CoreError> {
        MAYA_REQUIREMENTS
            .as_deref()
            .map_err(|e| CoreError::Manifest(e.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn complete_maya_project_returns_xml() {
        let files = paths(&[
            "workspace.mel",
            "images/",
            "scenes/shot_010.mb",
            "shot_010.xml",
        ]);
        let description = MayaRule::new().validate(&files).unwrap();
        assert_eq!(description, "shot_010.xml");
    }

    #[test]
    fn first_matching_xml_wins() {
        let files = paths(&[
            "workspace.mel",
            "images/beauty/0001.exr",
            "shot.ma",
            "a.xml",
            "b.xml",
        ]);
        assert_eq!(MayaRule::new().validate(&files).unwrap(), "a.xml");
    }

    #[test]
    fn missing_workspace_is_rejected() {
        let files = paths(&["images/", "shot.ma", "shot.xml"]);
        let err = MayaRule::new().validate(&files).unwrap_err();
        assert!(err.to_string().contains("workspace.mel"), "got: {err}");
    }

    #[test]
    fn nested_xml_does_not_count() {
        let files = paths(&["workspace.mel", "images/", "shot.ma", "data/shot.xml"]);
        let err = MayaRule::new().validate(&files).unwrap_err();
        assert!(err.to_string().contains(".xml"), "got: {err}");
    }

    fn maya(name: &str) -> Requirement {
        MayaRule::new()
            .requirements()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .unwrap()
    }

    #[test]
    fn scene_file_detection() {
        let scene = maya("scene file (.ma/.mb)");
        assert!(scene.matches("scenes/shot.mb"));
        assert!(scene.matches("shot.ma"));
        assert!(scene.matches("scenes/shot.mash.bak"));
        assert!(!scene.matches(".ma"));
        assert!(!scene.matches("shot.obj"));
    }

    #[test]
    fn word_characters_are_ascii_only() {
        let scene = maya("scene file (.ma/.mb)");
        assert!(!scene.matches("é.ma"));
        assert!(!scene.matches("scenes/ü.mb"));
        assert!(scene.matches("scenes/a_1.ma"));

        let xml = maya("top-level .xml");
        assert!(!xml.matches("shöt.xml"));
    }

    #[test]
    fn top_level_xml_detection() {
        let xml = maya("top-level .xml");
        assert!(xml.matches("shot_010.xml"));
        assert!(!xml.matches("dir/shot.xml"));
        assert!(!xml.matches("shot-010.xml"));
        assert!(!xml.matches(".xml"));
    }

    #[test]
    fn workspace_and_images_are_anchored_at_the_root() {
        assert!(maya("workspace.mel").matches("workspace.mel"));
        assert!(!maya("workspace.mel").matches("old/workspace.mel"));
        assert!(maya("images/").matches("images/beauty/0001.exr"));
        assert!(!maya("images/").matches("scenes/images/"));
    }

    #[test]
    fn kind_selects_rule() {
        let rule = JobKind::default().rule();
        assert_eq!(rule.kind(), JobKind::Maya);
        let requirements = rule.requirements().unwrap();
        assert_eq!(requirements.len(), 4);
        assert_eq!(requirements[2].pattern(), r"(?-u:\w)+\.(ma|mb)");
    }

    #[test]
    fn invalid_pattern_is_a_manifest_error() {
        let err = Requirement::new("broken", "(unclosed").unwrap_err();
        assert!(matches!(err, CoreError::Manifest(_)), "{err}");
    }
}
